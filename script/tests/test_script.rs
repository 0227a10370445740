use std::{fs, path::Path};

use scriptcc::{
    backend::text::FLAG_NO_DCE, CacheLocation, ErrorCode, Flags, FuncInfo, ObjectKind,
    RelocModel, Script, ScriptStatus,
};
use tempfile::TempDir;

const MAIN: &str = r#"
    pragma "version" = "1";
    pragma "java_package_name" = "com.example.rs";
    export var counter : 4;
    export var alloc : object;
    export var buffer : object;
    var scratch : 16;
    export func root size 32 calls [helper];
    export func init size 8;
    func helper size 16;
    func unused size 16;
    foreach kernel signature 31 size 64 calls [helper];
"#;

const LIB: &str = "func rsDebug size 8; func rsClamp size 8;";

fn write_source(dir: &Path, name: &str, text: &str) -> std::path::PathBuf {
    let path = dir.join(name);
    fs::write(&path, text).unwrap();
    path
}

fn script_from(path: &Path) -> Script {
    let mut script = Script::new();
    script.add_source_file(0, path, Flags::NONE).unwrap();
    script
}

#[test]
fn cached_script_matches_compiled() {
    let tmp = TempDir::new().unwrap();
    let src = write_source(tmp.path(), "main.rs.bc", MAIN);
    let loc = CacheLocation::new(tmp.path().join("cache"), "main");

    let mut first = script_from(&src);
    first.prepare_executable(Some(&loc), Flags::NONE).unwrap();
    assert_eq!(first.status(), ScriptStatus::Compiled);
    assert!(tmp.path().join("cache/main.o").exists());
    assert!(tmp.path().join("cache/main.o.info").exists());

    let mut second = script_from(&src);
    second.prepare_executable(Some(&loc), Flags::NONE).unwrap();
    assert_eq!(second.status(), ScriptStatus::Cached);
    assert_eq!(second.object_kind(), ObjectKind::Executable);
    assert_eq!(first.elf(), second.elf());
    assert_eq!(first.export_var_count(), second.export_var_count());
    assert_eq!(second.take_error(), ErrorCode::NoError);
}

#[test]
fn changed_source_bytes_recompile() {
    let tmp = TempDir::new().unwrap();
    let src = write_source(tmp.path(), "main.bc", MAIN);
    let loc = CacheLocation::new(tmp.path(), "main");

    script_from(&src)
        .prepare_executable(Some(&loc), Flags::NONE)
        .unwrap();
    fs::write(&src, MAIN.replace("size 64", "size 72")).unwrap();

    let mut script = script_from(&src);
    script.prepare_executable(Some(&loc), Flags::NONE).unwrap();
    assert_eq!(script.status(), ScriptStatus::Compiled);

    // the rewritten entry now serves the new bytes
    let mut again = script_from(&src);
    again.prepare_executable(Some(&loc), Flags::NONE).unwrap();
    assert_eq!(again.status(), ScriptStatus::Cached);
}

#[test]
fn changed_flags_recompile() {
    let tmp = TempDir::new().unwrap();
    let src = write_source(tmp.path(), "main.bc", MAIN);
    let loc = CacheLocation::new(tmp.path(), "main");

    script_from(&src)
        .prepare_relocatable(Some(&loc), RelocModel::Pic, Flags::NONE)
        .unwrap();

    let mut prepare_flags = script_from(&src);
    prepare_flags
        .prepare_relocatable(Some(&loc), RelocModel::Pic, FLAG_NO_DCE)
        .unwrap();
    assert_eq!(prepare_flags.status(), ScriptStatus::Compiled);

    let mut source_flags = Script::new();
    source_flags
        .add_source_file(0, &src, Flags::from(0x10))
        .unwrap();
    source_flags
        .prepare_relocatable(Some(&loc), RelocModel::Pic, FLAG_NO_DCE)
        .unwrap();
    assert_eq!(source_flags.status(), ScriptStatus::Compiled);

    let mut reloc = script_from(&src);
    reloc
        .prepare_relocatable(Some(&loc), RelocModel::Static, FLAG_NO_DCE)
        .unwrap();
    assert_eq!(reloc.status(), ScriptStatus::Compiled);
}

#[test]
fn library_is_part_of_the_entry() {
    let tmp = TempDir::new().unwrap();
    let src = write_source(tmp.path(), "main.bc", MAIN);
    let lib = write_source(tmp.path(), "lib.bc", LIB);
    let loc = CacheLocation::new(tmp.path(), "main");

    script_from(&src)
        .prepare_executable(Some(&loc), Flags::NONE)
        .unwrap();

    let mut with_lib = script_from(&src);
    with_lib.add_source_file(1, &lib, Flags::NONE).unwrap();
    with_lib.prepare_executable(Some(&loc), Flags::NONE).unwrap();
    assert_eq!(with_lib.status(), ScriptStatus::Compiled);
}

#[test]
fn export_counts_match_lists() {
    let mut script = Script::new();
    script
        .add_source_bitcode(0, "main.bc", MAIN, Flags::NONE)
        .unwrap();
    script.prepare_executable(None, Flags::NONE).unwrap();

    let mut big = [0usize; 16];
    assert_eq!(script.export_var_count(), 3);
    assert_eq!(script.export_var_list(&mut big), 3);
    assert_eq!(script.export_func_count(), 2);
    assert_eq!(script.export_func_list(&mut big), 2);
    assert_eq!(script.export_for_each_count(), 1);
    assert_eq!(script.export_for_each_list(&mut big), 1);
    assert_eq!(big[0], script.lookup("kernel").unwrap());

    let mut names = vec![];
    assert_eq!(script.export_var_name_list(&mut names), 3);
    assert_eq!(names, vec!["counter", "alloc", "buffer"]);
    names.clear();
    script.export_func_name_list(&mut names);
    assert_eq!(names, vec!["root", "init"]);

    let mut slots = [0u32; 4];
    assert_eq!(script.object_slot_count(), 2);
    assert_eq!(script.object_slot_list(&mut slots), 2);
    assert_eq!(&slots[..2], &[1, 2]);

    let mut sigs = [0u32; 1];
    assert_eq!(script.export_for_each_signature_list(&mut sigs), 1);
    assert_eq!(sigs, [31]);

    // root, init, helper, kernel
    assert_eq!(script.func_count(), 4);
    let mut infos = vec![FuncInfo::default(); 4];
    assert_eq!(script.func_info_list(&mut infos), 4);
    let root = infos.iter().find(|f| f.name == "root").unwrap();
    assert_eq!(root.size, 32);
    assert_eq!(Some(root.address), script.lookup("root"));

    let mut keys = [""; 2];
    let mut values = [""; 2];
    assert_eq!(script.pragma_count(), 2);
    assert_eq!(script.pragma_list(&mut keys, &mut values), 2);
    assert_eq!(keys, ["version", "java_package_name"]);
    assert_eq!(values, ["1", "com.example.rs"]);
    assert_eq!(script.take_error(), ErrorCode::NoError);
}

#[test]
fn short_buffers_truncate() {
    let mut script = Script::new();
    script
        .add_source_bitcode(0, "main.bc", MAIN, Flags::NONE)
        .unwrap();
    script.prepare_executable(None, Flags::NONE).unwrap();

    let mut one = [0usize; 1];
    assert_eq!(script.export_var_list(&mut one), 1);
    assert_eq!(Some(one[0]), script.lookup("counter"));
    assert_eq!(script.export_func_list(&mut []), 0);

    let mut keys = [""; 2];
    let mut values = [""; 1];
    assert_eq!(script.pragma_list(&mut keys, &mut values), 1);
    assert_eq!(keys, ["version", ""]);

    let mut infos = vec![FuncInfo::default(); 1];
    assert_eq!(script.func_info_list(&mut infos), 1);
    assert_eq!(script.take_error(), ErrorCode::NoError);
}

#[test]
fn unprepared_script_exposes_nothing() {
    let script = Script::new();
    assert_eq!(script.status(), ScriptStatus::Unknown);
    assert_eq!(script.object_kind(), ObjectKind::Unknown);
    assert_eq!(script.export_var_count(), 0);
    assert_eq!(script.export_func_count(), 0);
    assert_eq!(script.export_for_each_count(), 0);
    assert_eq!(script.pragma_count(), 0);
    assert_eq!(script.func_count(), 0);
    assert_eq!(script.object_slot_count(), 0);
    assert_eq!(script.export_var_list(&mut [0; 4]), 0);
    assert_eq!(script.elf(), None);
    assert_eq!(script.elf_size(), 0);
    assert_eq!(script.cache_location(), None);
    assert_eq!(script.take_error(), ErrorCode::NotPrepared);
    assert_eq!(script.take_error(), ErrorCode::NoError);
}

#[test]
fn first_error_is_kept_until_read() {
    let mut script = Script::new();
    assert!(script.add_source_bitcode(2, "x", "", Flags::NONE).is_err());
    assert!(script.prepare_executable(None, Flags::NONE).is_err());
    assert_eq!(script.export_var_count(), 0);

    assert_eq!(script.take_error(), ErrorCode::InvalidSlot);
    assert_eq!(script.take_error(), ErrorCode::NoError);

    script.set_error(ErrorCode::CacheCorrupt);
    script.set_error(ErrorCode::LinkFailure);
    assert_eq!(script.take_error(), ErrorCode::CacheCorrupt);
}

#[test]
fn occupied_slot_keeps_first_source() {
    let mut script = Script::new();
    script
        .add_source_bitcode(0, "main.bc", MAIN, Flags::NONE)
        .unwrap();
    assert!(script
        .add_source_bitcode(0, "other.bc", "func ;", Flags::NONE)
        .is_err());
    assert_eq!(script.take_error(), ErrorCode::InvalidSlot);
    script.prepare_executable(None, Flags::NONE).unwrap();
}

#[test]
fn shared_object_two_step_matches_direct() {
    let tmp = TempDir::new().unwrap();
    let loc = CacheLocation::new(tmp.path().join("cache"), "unit");

    let mut relocatable = Script::new();
    relocatable
        .add_source_bitcode(0, "main.bc", MAIN, Flags::NONE)
        .unwrap();
    relocatable
        .prepare_relocatable(Some(&loc), RelocModel::Pic, Flags::NONE)
        .unwrap();
    let obj = tmp.path().join("cache/unit.o");
    assert!(obj.exists());

    let two_step_out = tmp.path().join("two_step.so");
    let mut two_step = Script::new();
    two_step
        .prepare_shared_object(None, Some(&obj), &two_step_out, Flags::NONE)
        .unwrap();
    assert_eq!(two_step.status(), ScriptStatus::Compiled);
    assert_eq!(two_step.object_kind(), ObjectKind::SharedObject);

    let direct_out = tmp.path().join("direct.so");
    let mut direct = Script::new();
    direct
        .add_source_bitcode(0, "main.bc", MAIN, Flags::NONE)
        .unwrap();
    direct
        .prepare_shared_object(None, None, &direct_out, Flags::NONE)
        .unwrap();

    assert_eq!(fs::read(&two_step_out).unwrap(), fs::read(&direct_out).unwrap());
    assert_eq!(two_step.elf(), direct.elf());
    assert_eq!(direct.export_func_count(), 2);
}

#[test]
fn shared_object_ignores_library_slot() {
    let tmp = TempDir::new().unwrap();
    let mut script = Script::new();
    script
        .add_source_bitcode(0, "main.bc", MAIN, Flags::NONE)
        .unwrap();
    script
        .add_source_bitcode(1, "lib.bc", "func root size 8;", Flags::NONE)
        .unwrap();
    // linking the library would clash on `root`
    script
        .prepare_shared_object(None, None, &tmp.path().join("out.so"), Flags::NONE)
        .unwrap();
}

#[test]
fn cached_shared_object_still_writes_output() {
    let tmp = TempDir::new().unwrap();
    let loc = CacheLocation::new(tmp.path(), "unit");
    let first_out = tmp.path().join("first.so");
    let second_out = tmp.path().join("second.so");

    let mut first = Script::new();
    first
        .add_source_bitcode(0, "main.bc", MAIN, Flags::NONE)
        .unwrap();
    first
        .prepare_shared_object(Some(&loc), None, &first_out, Flags::NONE)
        .unwrap();

    let mut second = Script::new();
    second
        .add_source_bitcode(0, "main.bc", MAIN, Flags::NONE)
        .unwrap();
    second
        .prepare_shared_object(Some(&loc), None, &second_out, Flags::NONE)
        .unwrap();
    assert_eq!(second.status(), ScriptStatus::Cached);
    assert_eq!(fs::read(&first_out).unwrap(), fs::read(&second_out).unwrap());
}

#[test]
fn marked_symbols_survive_elimination() {
    let mut plain = Script::new();
    plain
        .add_source_bitcode(0, "main.bc", MAIN, Flags::NONE)
        .unwrap();
    plain.prepare_executable(None, Flags::NONE).unwrap();
    assert_eq!(plain.lookup("unused"), None);
    assert_eq!(plain.lookup("scratch"), None);

    let mut kept = Script::new();
    kept.add_source_bitcode(0, "main.bc", MAIN, Flags::NONE)
        .unwrap();
    kept.mark_external_symbol("unused");
    kept.mark_external_symbol("scratch");
    kept.prepare_executable(None, Flags::NONE).unwrap();
    assert!(kept.lookup("unused").is_some());
    assert!(kept.lookup("scratch").is_some());
    assert_eq!(kept.export_func_count(), 3);
    assert_eq!(kept.export_var_count(), 4);
}

#[test]
fn allow_list_is_part_of_the_entry() {
    let tmp = TempDir::new().unwrap();
    let loc = CacheLocation::new(tmp.path(), "main");

    let mut first = Script::new();
    first
        .add_source_bitcode(0, "main.bc", MAIN, Flags::NONE)
        .unwrap();
    first.prepare_executable(Some(&loc), Flags::NONE).unwrap();

    let mut second = Script::new();
    second
        .add_source_bitcode(0, "main.bc", MAIN, Flags::NONE)
        .unwrap();
    second.mark_external_symbol("unused");
    second.prepare_executable(Some(&loc), Flags::NONE).unwrap();
    assert_eq!(second.status(), ScriptStatus::Compiled);
    assert!(second.lookup("unused").is_some());
}

#[test]
fn imports_resolve_through_callback() {
    let text = "export func root size 16 calls [rsDebug, rsClamp];";

    let mut without = Script::new();
    without
        .add_source_bitcode(0, "main.bc", text, Flags::NONE)
        .unwrap();
    assert!(without.prepare_executable(None, Flags::NONE).is_err());
    assert_eq!(without.take_error(), ErrorCode::UnresolvedSymbol);
    assert_eq!(without.status(), ScriptStatus::Unknown);

    let mut with = Script::new();
    with.add_source_bitcode(0, "main.bc", text, Flags::NONE)
        .unwrap();
    with.register_symbol_callback(|name| match name {
        "rsDebug" => Some(0x1000),
        "rsClamp" => Some(0x2000),
        _ => None,
    });
    with.prepare_executable(None, Flags::NONE).unwrap();
    assert_eq!(with.lookup("rsDebug"), Some(0x1000));
    assert_eq!(with.lookup("missing"), None);
    assert_eq!(with.take_error(), ErrorCode::NoError);
}

#[test]
fn library_satisfies_imports() {
    let mut script = Script::new();
    script
        .add_source_bitcode(
            0,
            "main.bc",
            "export func root size 16 calls [rsDebug];",
            Flags::NONE,
        )
        .unwrap();
    script
        .add_source_bitcode(1, "lib.bc", LIB, Flags::NONE)
        .unwrap();
    script.prepare_executable(None, Flags::NONE).unwrap();
    assert!(script.lookup("rsDebug").is_some());
    // library functions are internal
    assert_eq!(script.export_func_count(), 1);
}
