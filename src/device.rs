//! Device id computation (spec §6.2).

/// Builds the stable device id for this instance: `[prefix@]hostname:cwd`.
pub fn device_id(custom_prefix: Option<&str>, hostname: &str, working_dir: &str) -> String {
    match custom_prefix {
        Some(prefix) if !prefix.is_empty() => format!("{prefix}@{hostname}:{working_dir}"),
        _ => format!("{hostname}:{working_dir}"),
    }
}

/// Replaces every character outside `[A-Za-z0-9._@-]` with `-`, so the id
/// can be used as a filename under `devices/`.
pub fn sanitize_for_filename(device_id: &str) -> String {
    device_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '@' | '-') {
                c
            } else {
                '-'
            }
        })
        .collect()
}

pub fn current_hostname() -> String {
    hostname_from_env().unwrap_or_else(|| "unknown-host".to_string())
}

fn hostname_from_env() -> Option<String> {
    let mut buf = vec![0u8; 256];
    let rc = unsafe { libc::gethostname(buf.as_mut_ptr() as *mut libc::c_char, buf.len()) };
    if rc != 0 {
        return None;
    }
    let nul = buf.iter().position(|&b| b == 0)?;
    buf.truncate(nul);
    String::from_utf8(buf).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_id_without_prefix() {
        assert_eq!(device_id(None, "mac", "/Users/a/proj"), "mac:/Users/a/proj");
    }

    #[test]
    fn device_id_with_prefix() {
        assert_eq!(
            device_id(Some("work"), "mac", "/Users/a/proj"),
            "work@mac:/Users/a/proj"
        );
    }

    #[test]
    fn device_id_with_empty_prefix_is_ignored() {
        assert_eq!(device_id(Some(""), "mac", "/x"), "mac:/x");
    }

    #[test]
    fn sanitize_replaces_path_separators_and_colon() {
        assert_eq!(
            sanitize_for_filename("work@mac:/Users/a/proj"),
            "work@mac--Users-a-proj"
        );
    }

    #[test]
    fn sanitize_keeps_allowed_characters() {
        let id = "a.b_c@d-e";
        assert_eq!(sanitize_for_filename(id), id);
    }

    #[test]
    fn current_hostname_is_nonempty() {
        assert!(!current_hostname().is_empty());
    }
}
