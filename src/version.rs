use serde::Serialize;

/// Build descriptor printed by `--version` and logged at start-up
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct VersionInfo {
    pub version: &'static str,
    pub git_commit: &'static str,
    pub build_type: &'static str,
    pub compiler: &'static str,
    pub rust_version: &'static str,
    pub platform: String,
}

impl VersionInfo {
    pub fn current() -> Self {
        VersionInfo {
            version: concat!("v", env!("CARGO_PKG_VERSION")),
            git_commit: option_env!("GIT_COMMIT").unwrap_or("<NO COMMIT HASH>"),
            build_type: option_env!("BUILD_TYPE").unwrap_or("dev"),
            compiler: "rustc",
            rust_version: option_env!("RUST_VERSION").unwrap_or("unknown"),
            platform: format!("{}/{}", std::env::consts::OS, std::env::consts::ARCH),
        }
    }
}

/// Single-line JSON form of [`VersionInfo::current`]
pub fn info() -> String {
    serde_json::to_string(&VersionInfo::current()).unwrap_or_default()
}
