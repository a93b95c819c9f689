//! Murmur Node -- library crate wiring the gossip core to its transport.
//!
//! Re-exports the config and transport modules so integration tests can
//! assemble in-process nodes.

pub mod config;
pub mod transport;

use std::path::PathBuf;

pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = std::env::var_os("HOME").map(PathBuf::from) {
            return home.join(stripped);
        }
    }
    PathBuf::from(path)
}

/// Bearer token for the admin API, created on first use.
pub fn load_or_create_token(path: &PathBuf) -> anyhow::Result<String> {
    if path.exists() {
        let token = std::fs::read_to_string(path)?.trim().to_string();
        return Ok(token);
    }

    use rand::Rng;
    let token: String = rand::thread_rng()
        .sample_iter(&rand::distributions::Alphanumeric)
        .take(48)
        .map(char::from)
        .collect();

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, &token)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }

    tracing::info!(path = %path.display(), "generated bearer token");
    Ok(token)
}

/// Choose the startup generation: the configured override when set,
/// otherwise strictly newer than anything persisted, and persist the choice
/// before gossiping starts.
pub fn choose_generation(
    store: &dyn murmur_storage::SystemStore,
    force: i32,
) -> anyhow::Result<i32> {
    let generation = if force > 0 {
        tracing::warn!(generation = force, "using forced gossip generation");
        force
    } else {
        let now = murmur_gossip::version::now_generation();
        match store.load_generation()? {
            Some(saved) => now.max(saved.saturating_add(1)),
            None => now,
        }
    };
    store.save_generation(generation)?;
    Ok(generation)
}

#[cfg(test)]
mod tests {
    use super::*;
    use murmur_storage::{SqliteSystemStore, SystemStore};

    #[test]
    fn test_expand_tilde() {
        std::env::set_var("HOME", "/home/crow");
        assert_eq!(
            expand_tilde("~/.murmur/config.toml"),
            PathBuf::from("/home/crow/.murmur/config.toml")
        );
        assert_eq!(expand_tilde("/abs/path"), PathBuf::from("/abs/path"));
    }

    #[test]
    fn test_choose_generation_is_monotonic_across_restarts() {
        let store = SqliteSystemStore::open_in_memory().unwrap();
        let g1 = choose_generation(&store, 0).unwrap();
        // Second boot in the same wall-clock second still advances.
        let g2 = choose_generation(&store, 0).unwrap();
        assert!(g2 > g1);
        assert_eq!(store.load_generation().unwrap(), Some(g2));
    }

    #[test]
    fn test_choose_generation_forced() {
        let store = SqliteSystemStore::open_in_memory().unwrap();
        let g = choose_generation(&store, 12_345).unwrap();
        assert_eq!(g, 12_345);
        assert_eq!(store.load_generation().unwrap(), Some(12_345));
    }

    #[test]
    fn test_choose_generation_survives_clock_regression() {
        let store = SqliteSystemStore::open_in_memory().unwrap();
        // A generation persisted far in the future (bad clock on last boot).
        let future = murmur_gossip::version::now_generation() + 10_000;
        store.save_generation(future).unwrap();
        let g = choose_generation(&store, 0).unwrap();
        assert_eq!(g, future + 1);
    }
}
