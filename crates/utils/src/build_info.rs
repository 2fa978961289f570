use std::sync::LazyLock;

/// Git metadata captured by the build script, when the crate was built from a checkout.
pub(crate) struct BuildInfo {
    pub commit_sha1: Option<&'static str>,
    pub git_dirty: bool,
}

pub(crate) static BUILD_INFO: LazyLock<BuildInfo> = LazyLock::new(|| BuildInfo {
    commit_sha1: option_env!("VERGEN_GIT_SHA"),
    git_dirty: option_env!("VERGEN_GIT_DIRTY") == Some("true"),
});
