use keyring::Entry;
use log::warn;

const SERVICE: &str = "studymatch_chat";
const ACCESS_USER: &str = "studymatch_access_token";
const REFRESH_USER: &str = "studymatch_refresh_token";

fn fallback_enabled() -> bool {
    std::env::var("KEYRING_FALLBACK").unwrap_or_default() == "true"
}

fn fallback_path(name: &str) -> std::path::PathBuf {
    std::path::Path::new("data").join(name)
}

fn store_secret(user: &str, fallback_file: &str, secret: &str) -> anyhow::Result<()> {
    let entry = Entry::new(SERVICE, user);
    match entry.set_password(secret) {
        Ok(()) => Ok(()),
        Err(_e) => {
            // Keyring failed. Fall back to a local file only when explicitly allowed
            if fallback_enabled() {
                let path = fallback_path(fallback_file);
                if let Some(parent) = path.parent() {
                    let _ = std::fs::create_dir_all(parent);
                }
                std::fs::write(&path, secret)?;
                warn!("[SESSION_STORE] keyring unavailable, persisted {} to fallback file", user);
                Ok(())
            } else {
                // do not persist to disk silently; return error so caller can decide
                Err(anyhow::anyhow!("keyring unavailable and file fallback disabled"))
            }
        }
    }
}

fn load_secret(user: &str, fallback_file: &str) -> Option<String> {
    let entry = Entry::new(SERVICE, user);
    match entry.get_password() {
        Ok(t) => {
            if t.trim().is_empty() { None } else { Some(t) }
        }
        Err(_e) => {
            if fallback_enabled() {
                let path = fallback_path(fallback_file);
                if path.exists() {
                    if let Ok(s) = std::fs::read_to_string(&path) {
                        let t = s.trim().to_string();
                        if !t.is_empty() {
                            return Some(t);
                        }
                    }
                }
            }
            None
        }
    }
}

fn clear_secret(user: &str, fallback_file: &str) {
    let entry = Entry::new(SERVICE, user);
    let _ = entry.delete_password();
    if fallback_enabled() {
        let path = fallback_path(fallback_file);
        if path.exists() {
            let _ = std::fs::remove_file(&path);
        }
    }
}

/// Persist the token pair after login or refresh. A missing refresh token
/// clears any previously stored one so a stale refresh token cannot outlive
/// its session.
pub fn save_tokens(access: &str, refresh: Option<&str>) -> anyhow::Result<()> {
    store_secret(ACCESS_USER, "access_token.txt", access)?;
    match refresh {
        Some(refresh) => store_secret(REFRESH_USER, "refresh_token.txt", refresh)?,
        None => clear_secret(REFRESH_USER, "refresh_token.txt"),
    }
    Ok(())
}

/// Returns `(access, refresh)` when an access token is stored.
pub fn load_tokens() -> Option<(String, Option<String>)> {
    let access = load_secret(ACCESS_USER, "access_token.txt")?;
    let refresh = load_secret(REFRESH_USER, "refresh_token.txt");
    Some((access, refresh))
}

pub fn clear_tokens() {
    clear_secret(ACCESS_USER, "access_token.txt");
    clear_secret(REFRESH_USER, "refresh_token.txt");
}
