const fn release_or_cargo_version(opt: Option<&'static str>) -> &'static str {
    match opt {
        Some(val) => val,
        None => env!("CARGO_PKG_VERSION"),
    }
}

/// Build version, overridable at compile time through `TVBOX_AGENT_VERSION`.
pub const VERSION: &str = release_or_cargo_version(option_env!("TVBOX_AGENT_VERSION"));

/// `User-Agent` sent with every batch write.
pub fn user_agent() -> String {
    format!("tvbox-agent/{VERSION}")
}
