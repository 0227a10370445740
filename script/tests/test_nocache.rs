//! Tests that change `SCRIPTCC_NOCACHE`. They live in their own binary so the
//! environment is never shared with the other suites, and take `ENV_LOCK` so
//! they never overlap each other.

use std::{fs, sync::Mutex};

use scriptcc::{cache::NOCACHE_ENV, CacheLocation, Flags, Script, ScriptStatus};
use tempfile::TempDir;

static ENV_LOCK: Mutex<()> = Mutex::new(());

const MAIN: &str = "export func root size 16 calls [helper]; func helper size 8;";

fn prepared(dir: &TempDir) -> Script {
    let src = dir.path().join("main.bc");
    fs::write(&src, MAIN).unwrap();
    let loc = CacheLocation::new(dir.path(), "unit");
    let mut script = Script::new();
    script.add_source_file(0, &src, Flags::NONE).unwrap();
    script.prepare_executable(Some(&loc), Flags::NONE).unwrap();
    script
}

#[test]
fn nocache_skips_cache() {
    let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    let tmp = TempDir::new().unwrap();

    std::env::set_var(NOCACHE_ENV, "1");
    let script = prepared(&tmp);
    std::env::remove_var(NOCACHE_ENV);

    assert_eq!(script.status(), ScriptStatus::Compiled);
    assert_eq!(script.cache_location(), None);
    assert!(script.lookup("root").is_some());
    assert!(!tmp.path().join("unit.o").exists());
    assert!(!tmp.path().join("unit.o.info").exists());
}

#[test]
fn nocache_makes_script_uncacheable() {
    let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    let tmp = TempDir::new().unwrap();
    let src = tmp.path().join("main.bc");
    fs::write(&src, MAIN).unwrap();
    let mut script = Script::new();
    script.add_source_file(0, &src, Flags::NONE).unwrap();

    std::env::set_var(NOCACHE_ENV, "yes");
    let disabled = script.is_cacheable();
    std::env::remove_var(NOCACHE_ENV);
    assert!(!disabled);
    assert!(script.is_cacheable());
}

#[test]
fn zero_or_empty_keeps_cache() {
    let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    for value in ["0", ""] {
        let tmp = TempDir::new().unwrap();
        std::env::set_var(NOCACHE_ENV, value);
        let script = prepared(&tmp);
        std::env::remove_var(NOCACHE_ENV);

        assert!(script.cache_location().is_some(), "{value:?}");
        assert!(tmp.path().join("unit.o.info").exists(), "{value:?}");
    }
}
