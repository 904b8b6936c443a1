//! Constants used throughout ember-core.

/// Recommended ceiling on re-acquire attempts after a payload fails
/// verification. Once exhausted, the UX gets the final say.
pub const CACHE_MAX_RECOMMENDED_VERIFY_TRYAGAIN_ATTEMPTS: u32 = 2;

/// Directory under the cache root holding staged, not-yet-verified
/// files.
pub const CACHE_UNVERIFIED_DIR: &str = ".unverified";

/// File name of the persisted registration state inside the bundle's
/// cache directory.
pub const REGISTRATION_STATE_FILE: &str = "state.json";

/// File name of the persisted variable stream inside the bundle's
/// cache directory.
pub const VARIABLES_STATE_FILE: &str = "variables.dat";

/// Variable naming the directory the bundle was originally launched
/// from; relative payload sources resolve against it.
pub const VARIABLE_SOURCE_FOLDER: &str = "BundleSourceFolder";

/// Engine-written built-in variable names.
pub const VARIABLE_BUNDLE_ACTION: &str = "BundleAction";
pub const VARIABLE_BUNDLE_INSTALLED: &str = "BundleInstalled";
pub const VARIABLE_BUNDLE_ELEVATED: &str = "BundleElevated";
pub const VARIABLE_BUNDLE_PROVIDER_KEY: &str = "BundleProviderKey";
pub const VARIABLE_BUNDLE_TAG: &str = "BundleTag";
