use adt_core::rest::{MachineInfo, OsUser};

/// Minimal description of the host sent at registration. Interfaces, ids and
/// group membership are left empty.
pub fn collect() -> MachineInfo {
    let hostname = hostname::get()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "unknown".to_string());
    let home_directory = dirs::home_dir()
        .map(|path| path.display().to_string())
        .unwrap_or_default();

    MachineInfo {
        hostname,
        os: std::env::consts::OS.to_string(),
        network_interfaces: Vec::new(),
        os_current_user: OsUser {
            username: whoami::username(),
            display_name: whoami::realname(),
            home_directory,
            ..OsUser::default()
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collected_info_names_host_and_user() {
        let info = collect();
        assert!(!info.hostname.is_empty());
        assert_eq!(info.os, std::env::consts::OS);
        assert!(!info.os_current_user.username.is_empty());
        assert!(info.network_interfaces.is_empty());
    }
}
