//! Thin CLI surface: one subcommand per logical browser operation.
//! Business logic lives entirely in `ops::*`/`cdp::*`; this module only
//! parses arguments and shapes them into operation calls.

use std::collections::HashMap;
use std::time::Duration;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(author, version, about = "cdp-ctl: command-line controller for a Chromium-family browser over CDP", long_about = None)]
pub struct Args {
    /// Chrome DevTools host
    #[arg(long, default_value = "localhost")]
    pub chrome_host: String,

    /// Chrome DevTools port
    #[arg(long, default_value_t = 9222)]
    pub chrome_port: u16,

    /// Target id to operate on; defaults to the first page target
    #[arg(long)]
    pub target: Option<String>,

    /// Log level
    #[arg(long, default_value = "info")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// List page targets
    Tabs,
    /// Open a new tab
    NewTab { url: Option<String> },
    /// Close a tab
    CloseTab { target_id: String },

    Navigate { url: String, #[arg(long)] wait: bool },
    Back,
    Forward,
    Reload { #[arg(long)] ignore_cache: bool },
    Source,
    Info,

    Click { selector: String },
    Doubleclick { selector: String },
    Tripleclick { selector: String },
    Rightclick { selector: String },
    Clickat { x: f64, y: f64 },
    Drag { src: String, dst: String },
    Tap { selector: String },
    Swipe { selector: String, direction: String },
    Pinch { selector: String, direction: String },
    Presskey { key: String, #[arg(long)] modifiers: Vec<String> },
    Type { text: String },
    Fill { selector: String, text: String },
    Clear { selector: String },
    Setvalue { selector: String, value: String },
    Select { selector: String, value: String },
    Check { selector: String },
    Uncheck { selector: String },
    Upload { selector: String, files: Vec<String> },
    Dispatch { selector: String, event_type: String },

    Query { selector: String },
    Attr { selector: String, name: String },
    Shadow { host: String, inner: String },

    Screenshot { #[arg(long)] selector: Option<String>, #[arg(long)] format: Option<String>, #[arg(long)] quality: Option<i64> },
    Pdf,
    Viewport { width: i64, height: i64, #[arg(long)] scale: Option<f64>, #[arg(long)] mobile: bool },
    UserAgent { value: String },
    Emulate { device: String },
    Media { #[arg(long)] feature: Vec<String> },
    Scrollto { selector: String },
    Scrolltop,
    Scrollbottom,
    Scroll { dx: f64, dy: f64 },

    Cookies { #[arg(long)] set: Option<String>, #[arg(long)] domain: Option<String>, #[arg(long)] delete: Option<String>, #[arg(long)] clear: bool },
    Storage { key: Option<String>, value: Option<String>, #[arg(long)] session: bool, #[arg(long)] clear: bool },
    Permission { name: String, setting: String },
    Geolocation { latitude: f64, longitude: f64 },
    Clipboard { #[arg(long)] read: bool, #[arg(long)] write: Option<String> },
    Dialog { #[arg(long)] accept: bool, #[arg(long)] prompt_text: Option<String> },

    Wait { selector: String, #[arg(long, default_value_t = 30)] timeout: u64 },
    Waitgone { selector: String, #[arg(long, default_value_t = 30)] timeout: u64 },
    Waittext { text: String, #[arg(long, default_value_t = 30)] timeout: u64 },
    Waitfn { expression: String, #[arg(long, default_value_t = 30)] timeout: u64 },
    Waiturl { pattern: String, #[arg(long, default_value_t = 30)] timeout: u64 },
    Waitnav { #[arg(long, default_value_t = 30)] timeout: u64 },
    Waitload { #[arg(long, default_value_t = 30)] timeout: u64 },
    Waitrequest { pattern: String, #[arg(long, default_value_t = 30)] timeout: u64 },
    Waitresponse { pattern: String, #[arg(long, default_value_t = 30)] timeout: u64 },
    Waitidle { #[arg(long, default_value_t = 500)] idle_ms: u64, #[arg(long, default_value_t = 30)] timeout: u64 },

    Console { #[arg(long, default_value_t = 0)] duration: u64 },
    Errors { #[arg(long, default_value_t = 0)] duration: u64 },
    Network { #[arg(long, default_value_t = 0)] duration: u64 },

    Block { patterns: Vec<String>, #[arg(long)] disable: bool },
    Throttle { preset: Option<String>, #[arg(long)] disable: bool },
    Offline { #[arg(long)] on: bool },
    Responsebody { request_id: String },
    Har { #[arg(long, default_value_t = 10)] duration: u64 },
}

#[allow(dead_code)]
pub(crate) fn parse_media_features(raw: &[String]) -> HashMap<String, String> {
    raw.iter()
        .filter_map(|entry| entry.split_once('='))
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

#[allow(dead_code)]
pub(crate) fn secs(n: u64) -> Duration {
    Duration::from_secs(n)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_media_features_splits_on_equals() {
        let raw = vec!["prefers-color-scheme=dark".to_string(), "malformed".to_string()];
        let features = parse_media_features(&raw);
        assert_eq!(features.get("prefers-color-scheme"), Some(&"dark".to_string()));
        assert_eq!(features.len(), 1);
    }
}
