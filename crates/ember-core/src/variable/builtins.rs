//! Built-in variable providers.
//!
//! Each provider runs lazily on the first read of its variable. A
//! provider that returns `None` leaves the variable as type-none, so
//! reads keep reporting not-found without poisoning the store.

use std::env;

use super::VariableValue;
use crate::version::Version;

pub(super) const BUILT_IN_VARIABLES: &[(&str, fn() -> Option<VariableValue>)] = &[
    ("AppDataFolder", init_app_data_folder),
    ("BundleAction", init_zero),
    ("BundleElevated", init_zero),
    ("BundleInstalled", init_zero),
    ("BundleProviderKey", init_empty_string),
    ("BundleTag", init_empty_string),
    ("CommonFilesFolder", init_common_files_folder),
    ("Date", init_date),
    ("DesktopFolder", init_desktop_folder),
    ("FontsFolder", init_fonts_folder),
    ("InstallerName", init_installer_name),
    ("InstallerVersion", init_installer_version),
    ("LocalAppDataFolder", init_local_app_data_folder),
    ("LogonUser", init_logon_user),
    ("NTProductType", init_none),
    ("PersonalFolder", init_home_folder),
    ("Privileged", init_privileged),
    ("ProgramFiles64Folder", init_program_files_folder),
    ("ProgramFilesFolder", init_program_files_folder),
    ("RebootPending", init_reboot_pending),
    ("ServicePackLevel", init_zero),
    ("StartMenuFolder", init_start_menu_folder),
    ("System64Folder", init_system64_folder),
    ("SystemFolder", init_system_folder),
    ("SystemLanguageID", init_language_id),
    ("TempFolder", init_temp_folder),
    ("TerminalServer", init_zero),
    ("UserLanguageID", init_language_id),
    ("VersionMsi", init_none),
    ("VersionOS", init_version_os),
    ("WindowsFolder", init_windows_folder),
    ("WindowsVolume", init_root_volume),
];

fn init_none() -> Option<VariableValue> {
    None
}

fn init_zero() -> Option<VariableValue> {
    Some(VariableValue::Numeric(0))
}

fn init_empty_string() -> Option<VariableValue> {
    Some(VariableValue::String(String::new()))
}

fn init_installer_name() -> Option<VariableValue> {
    Some(VariableValue::String("ember".to_string()))
}

fn init_installer_version() -> Option<VariableValue> {
    env!("CARGO_PKG_VERSION")
        .parse::<Version>()
        .ok()
        .map(VariableValue::Version)
}

fn init_date() -> Option<VariableValue> {
    Some(VariableValue::String(
        chrono::Local::now().format("%Y-%m-%d").to_string(),
    ))
}

fn init_logon_user() -> Option<VariableValue> {
    if let Ok(Some(user)) = nix::unistd::User::from_uid(nix::unistd::geteuid()) {
        return Some(VariableValue::String(user.name));
    }
    env::var("USER").ok().map(VariableValue::String)
}

fn init_privileged() -> Option<VariableValue> {
    Some(VariableValue::Numeric(i64::from(
        nix::unistd::geteuid().is_root(),
    )))
}

fn init_reboot_pending() -> Option<VariableValue> {
    let pending = std::path::Path::new("/run/reboot-required").exists();
    Some(VariableValue::Numeric(i64::from(pending)))
}

fn init_temp_folder() -> Option<VariableValue> {
    Some(VariableValue::String(
        env::temp_dir().display().to_string(),
    ))
}

fn init_home_folder() -> Option<VariableValue> {
    env::var("HOME").ok().map(VariableValue::String)
}

fn init_desktop_folder() -> Option<VariableValue> {
    let home = env::var("HOME").ok()?;
    Some(VariableValue::String(format!("{home}/Desktop")))
}

fn init_app_data_folder() -> Option<VariableValue> {
    if let Ok(dir) = env::var("XDG_DATA_HOME") {
        return Some(VariableValue::String(dir));
    }
    let home = env::var("HOME").ok()?;
    Some(VariableValue::String(format!("{home}/.local/share")))
}

fn init_local_app_data_folder() -> Option<VariableValue> {
    if let Ok(dir) = env::var("XDG_STATE_HOME") {
        return Some(VariableValue::String(dir));
    }
    let home = env::var("HOME").ok()?;
    Some(VariableValue::String(format!("{home}/.local/state")))
}

fn init_start_menu_folder() -> Option<VariableValue> {
    let home = env::var("HOME").ok()?;
    Some(VariableValue::String(format!(
        "{home}/.local/share/applications"
    )))
}

fn init_fonts_folder() -> Option<VariableValue> {
    Some(VariableValue::String("/usr/share/fonts".to_string()))
}

fn init_program_files_folder() -> Option<VariableValue> {
    Some(VariableValue::String(
        env::var("PROGRAMFILES").unwrap_or_else(|_| "/usr/local".to_string()),
    ))
}

fn init_common_files_folder() -> Option<VariableValue> {
    Some(VariableValue::String(
        env::var("COMMONPROGRAMFILES").unwrap_or_else(|_| "/usr/share".to_string()),
    ))
}

fn init_system_folder() -> Option<VariableValue> {
    Some(VariableValue::String("/usr/lib".to_string()))
}

fn init_system64_folder() -> Option<VariableValue> {
    Some(VariableValue::String("/usr/lib64".to_string()))
}

fn init_windows_folder() -> Option<VariableValue> {
    env::var("WINDIR").ok().map(VariableValue::String)
}

fn init_root_volume() -> Option<VariableValue> {
    Some(VariableValue::String("/".to_string()))
}

fn init_version_os() -> Option<VariableValue> {
    let release = std::fs::read_to_string("/proc/sys/kernel/osrelease").ok()?;
    // keep only the leading numeric fields ("6.8.0-41-generic" -> 6.8.0)
    let numeric: String = release
        .trim()
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == '.')
        .collect();
    numeric
        .trim_end_matches('.')
        .parse::<Version>()
        .ok()
        .map(VariableValue::Version)
}

fn init_language_id() -> Option<VariableValue> {
    let lang = env::var("LC_ALL")
        .or_else(|_| env::var("LANG"))
        .ok()?;
    let id = match lang.get(..2)? {
        "en" => 1033,
        "de" => 1031,
        "fr" => 1036,
        "es" => 1034,
        "ja" => 1041,
        "zh" => 2052,
        _ => 0,
    };
    Some(VariableValue::Numeric(id))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_installer_version_parses() {
        assert!(matches!(
            init_installer_version(),
            Some(VariableValue::Version(_))
        ));
    }

    #[test]
    fn test_date_is_iso_like() {
        let Some(VariableValue::String(date)) = init_date() else {
            panic!("date initializer failed");
        };
        assert_eq!(date.len(), 10);
        assert_eq!(date.as_bytes()[4], b'-');
    }

    #[test]
    fn test_failed_provider_returns_none() {
        // VersionMsi has no runtime to probe on this platform
        assert!(init_none().is_none());
    }
}
