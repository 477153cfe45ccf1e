//! CLI 参数、环境变量与启动时一次性解析的配置。

use clap::Parser;
use shadow_rs::formatcp;
use std::path::PathBuf;

use crate::build;
use crate::view::RawMarkup;

const VERSION_INFO: &str = formatcp!(
    r#"{}\ncommit_hash: {}\nbuild_time: {}\nbuild_env: {},{}"#,
    build::PKG_VERSION,
    build::SHORT_COMMIT,
    build::BUILD_TIME,
    build::RUST_VERSION,
    build::RUST_CHANNEL
);

pub const DEFAULT_FILES_DIR: &str = "/files";
pub const DEFAULT_TITLE: &str = "File Server";
pub const DEFAULT_PORT: u16 = 8000;
pub const ENV_ENABLE_UPLOAD: &str = "ENABLE_UPLOAD";
pub const ENV_ENABLE_METRICS: &str = "ENABLE_METRICS";

/// CLI arguments and environment configuration for the server.
#[derive(Parser, Debug, Default)]
#[command(name = "filebrowser", version = VERSION_INFO, about = "Minimal HTTP file browser")]
pub struct Args {
    #[arg(
        short = 'r',
        long,
        env = "FILES_DIR",
        default_value = DEFAULT_FILES_DIR,
        help = "Directory to serve and upload into"
    )]
    pub root: String,
    #[arg(
        short = 'b',
        long,
        env = "FILEBROWSER_BIND",
        default_value = "0.0.0.0",
        help = "Bind address"
    )]
    pub bind: String,
    #[arg(
        short = 'p',
        long,
        env = "FILEBROWSER_PORT",
        default_value_t = DEFAULT_PORT,
        help = "HTTP port"
    )]
    pub port: u16,
    #[arg(long, env = "TITLE", default_value = DEFAULT_TITLE, help = "Page title")]
    pub title: String,
    #[arg(
        long,
        env = "EXTRA_HEADERS",
        default_value = "",
        help = "Raw markup injected into the page head"
    )]
    pub extra_headers: String,
    #[arg(
        long,
        num_args = 0..=1,
        default_missing_value = "true",
        help = "Enable file uploads (overrides ENABLE_UPLOAD)"
    )]
    pub enable_upload: Option<bool>,
    #[arg(
        long,
        num_args = 0..=1,
        default_missing_value = "true",
        help = "Enable the /metrics endpoint (overrides ENABLE_METRICS)"
    )]
    pub enable_metrics: Option<bool>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BuildInfo {
    pub commit: String,
    pub date: String,
}

impl BuildInfo {
    pub fn current() -> Self {
        Self {
            commit: or_unknown(build::SHORT_COMMIT),
            date: or_unknown(build::BUILD_TIME),
        }
    }
}

fn or_unknown(value: &str) -> String {
    if value.trim().is_empty() {
        "unknown".into()
    } else {
        value.into()
    }
}

/// 启动后不可变的运行配置。
#[derive(Clone, Debug)]
pub struct Settings {
    pub root: PathBuf,
    pub title: String,
    pub extra_headers: RawMarkup,
    pub upload_enabled: bool,
    pub metrics_enabled: bool,
    pub build: BuildInfo,
}

impl Settings {
    /// 按 “命令行 > 环境变量 > 默认值” 合并开关项。
    pub fn resolve(args: &Args, env: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            root: PathBuf::from(&args.root),
            title: args.title.clone(),
            extra_headers: RawMarkup::new(args.extra_headers.clone()),
            upload_enabled: resolve_toggle(args.enable_upload, env(ENV_ENABLE_UPLOAD), false),
            metrics_enabled: resolve_toggle(args.enable_metrics, env(ENV_ENABLE_METRICS), false),
            build: BuildInfo::current(),
        }
    }
}

fn resolve_toggle(flag: Option<bool>, env: Option<String>, default: bool) -> bool {
    flag.or_else(|| env.as_deref().and_then(parse_bool))
        .unwrap_or(default)
}

/// 接受 `1/t/T/TRUE/true/True` 与 `0/f/F/FALSE/false/False`。
pub fn parse_bool(value: &str) -> Option<bool> {
    match value {
        "1" | "t" | "T" | "TRUE" | "true" | "True" => Some(true),
        "0" | "f" | "F" | "FALSE" | "false" | "False" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
pub(crate) fn test_settings(root: PathBuf) -> Settings {
    Settings {
        root,
        title: DEFAULT_TITLE.into(),
        extra_headers: RawMarkup::default(),
        upload_enabled: false,
        metrics_enabled: false,
        build: BuildInfo {
            commit: "abc1234".into(),
            date: "2024-01-01".into(),
        },
    }
}
