//! Header, path, and status transformations applied by the `header_modifiers`
//! and `status_remap` response-phase stages (§4.2 phase 7).
//!
//! Generalizes `kairos-rs::middleware::transform`'s `HeaderTransformation`/
//! `TransformAction` pair, rebased from actix's `HeaderMap` onto the plain
//! `Vec<(String, String)>` lists `ProxyRequest`/`ProxyResponse` carry.

use regex::Regex;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum TransformAction {
    Add,
    Set,
    Remove,
    Replace,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeaderTransformation {
    pub action: TransformAction,
    pub name: String,
    pub value: Option<String>,
    pub pattern: Option<String>,
    pub replacement: Option<String>,
}

impl HeaderTransformation {
    fn apply(&self, headers: &mut Vec<(String, String)>) {
        match self.action {
            TransformAction::Add => {
                if !headers.iter().any(|(n, _)| n.eq_ignore_ascii_case(&self.name)) {
                    if let Some(v) = &self.value {
                        headers.push((self.name.clone(), v.clone()));
                    }
                }
            }
            TransformAction::Set => {
                headers.retain(|(n, _)| !n.eq_ignore_ascii_case(&self.name));
                if let Some(v) = &self.value {
                    headers.push((self.name.clone(), v.clone()));
                }
            }
            TransformAction::Remove => {
                headers.retain(|(n, _)| !n.eq_ignore_ascii_case(&self.name));
            }
            TransformAction::Replace => {
                let (Some(pattern), Some(replacement)) = (&self.pattern, &self.replacement) else { return };
                let Ok(re) = Regex::new(pattern) else { return };
                for (n, v) in headers.iter_mut() {
                    if n.eq_ignore_ascii_case(&self.name) {
                        *v = re.replace_all(v, replacement.as_str()).to_string();
                    }
                }
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct HeaderTransformSet {
    #[serde(default)]
    pub rules: Vec<HeaderTransformation>,
}

impl HeaderTransformSet {
    pub fn apply(&self, headers: &mut Vec<(String, String)>) {
        for rule in &self.rules {
            rule.apply(headers);
        }
    }
}

/// Maps a backend status code to a different one returned to the client
/// (`status_remap` stage).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusCodeMapping {
    pub from: u16,
    pub to: u16,
}

pub fn remap_status(mappings: &[StatusCodeMapping], status: u16) -> u16 {
    mappings.iter().find(|m| m.from == status).map(|m| m.to).unwrap_or(status)
}
