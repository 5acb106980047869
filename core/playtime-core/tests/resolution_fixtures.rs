use playtime_core::{
    resolve_tracking_target, tracking_delay, HeuristicTables, ResolutionStrategy, TitleClass,
};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::time::Duration;

const MB: u64 = 1024 * 1024;

fn fixture_tables() -> HeuristicTables {
    let path = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures/heuristics-v1.toml");
    HeuristicTables::load(&path).expect("load fixture tables")
}

/// Creates a sparse file so large binaries cost nothing on disk.
fn sparse_file(path: &Path, size: u64) {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).expect("create dirs");
    }
    let file = File::create(path).expect("create file");
    file.set_len(size).expect("set len");
}

#[test]
fn generic_game_resolves_to_largest_binary() {
    let install = tempfile::tempdir().expect("temp dir");
    sparse_file(&install.path().join("setup.exe"), 2 * MB);
    sparse_file(&install.path().join("GenericGame.exe"), 400 * MB);

    let tables = HeuristicTables::builtin().expect("builtin tables");
    let target = resolve_tracking_target(1, Some(install.path()), "Generic Game", &tables)
        .expect("resolve");

    assert_eq!(target.strategy, ResolutionStrategy::LargestExecutable);
    assert_eq!(target.exe_path, Some(install.path().join("GenericGame.exe")));
    assert!(target.track_children);
}

#[test]
fn size_heuristic_ignores_larger_utilities() {
    let install = tempfile::tempdir().expect("temp dir");
    sparse_file(&install.path().join("Game.exe"), 50 * MB);
    sparse_file(&install.path().join("Redist/vcredist_x64.exe"), 90 * MB);
    sparse_file(&install.path().join("unins000.exe"), 80 * MB);

    let tables = HeuristicTables::builtin().expect("builtin tables");
    let target =
        resolve_tracking_target(2, Some(install.path()), "Game", &tables).expect("resolve");

    assert_eq!(target.exe_path, Some(install.path().join("Game.exe")));
}

#[test]
fn anti_cheat_title_waits_longer_than_unlisted_title() {
    let tables = HeuristicTables::builtin().expect("builtin tables");
    assert_eq!(tables.classify("Valorant"), TitleClass::AntiCheat);
    assert_eq!(tracking_delay("Valorant", &tables), Duration::from_secs(60));
    assert_eq!(tracking_delay("Generic Game", &tables), Duration::from_secs(3));
}

#[test]
fn known_title_without_install_dir_falls_back_to_process_names() {
    let tables = HeuristicTables::builtin().expect("builtin tables");
    let target = resolve_tracking_target(3, None, "Apex Legends", &tables).expect("resolve");

    assert_eq!(target.strategy, ResolutionStrategy::KnownProcessNames);
    assert!(target.exe_path.is_none());
    assert_eq!(
        target.process_names,
        Some(vec!["r5apex.exe".to_string(), "r5apex_dx12.exe".to_string()])
    );
}

#[test]
fn known_title_prefers_exact_binary_inside_nested_layout() {
    let install = tempfile::tempdir().expect("temp dir");
    sparse_file(&install.path().join("Launcher.exe"), 300 * MB);
    sparse_file(&install.path().join("Game/ArenaClient.exe"), 10 * MB);

    let tables = fixture_tables();
    let target = resolve_tracking_target(4, Some(install.path()), "Arena Shooter", &tables)
        .expect("resolve");

    assert_eq!(target.strategy, ResolutionStrategy::KnownExecutable);
    assert_eq!(
        target.exe_path,
        Some(install.path().join("Game/ArenaClient.exe"))
    );
}

#[test]
fn unreal_shipping_binary_beats_root_bootstrapper() {
    let install = tempfile::tempdir().expect("temp dir");
    sparse_file(&install.path().join("Palworld.exe"), 512 * 1024);
    sparse_file(
        &install.path().join("Pal/Binaries/Win64/Palworld-Win64-Shipping.exe"),
        300 * MB,
    );

    let tables = HeuristicTables::builtin().expect("builtin tables");
    let target = resolve_tracking_target(7, Some(install.path()), "Palworld", &tables)
        .expect("resolve");

    assert_eq!(target.strategy, ResolutionStrategy::KnownExecutable);
    assert_eq!(
        target.exe_path,
        Some(install.path().join("Pal/Binaries/Win64/Palworld-Win64-Shipping.exe"))
    );
}

#[test]
fn fixture_tables_drive_delay_and_depth() {
    let tables = fixture_tables();
    assert_eq!(tracking_delay("Arena Shooter", &tables), Duration::from_secs(45));
    assert_eq!(tracking_delay("Puzzle Game", &tables), Duration::from_secs(2));

    let install = tempfile::tempdir().expect("temp dir");
    sparse_file(&install.path().join("a/b/c/Deep.exe"), 10 * MB);
    sparse_file(&install.path().join("a/Shallow.x86_64"), MB);

    let target = resolve_tracking_target(5, Some(install.path()), "Puzzle Game", &tables)
        .expect("resolve");
    assert_eq!(target.exe_path, Some(install.path().join("a/Shallow.x86_64")));
}

#[test]
fn empty_directory_for_unknown_title_is_a_resolution_failure() {
    let install = tempfile::tempdir().expect("temp dir");
    let tables = HeuristicTables::builtin().expect("builtin tables");
    let err = resolve_tracking_target(6, Some(install.path()), "Indie Thing", &tables)
        .expect_err("nothing to track");

    assert_eq!(err.session_id, 6);
    assert_eq!(err.candidates_scanned, 0);
}
