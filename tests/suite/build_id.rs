use std::fs;

use symcache::BuildIdSymbolResolver;
use symcache::Context;
use symcache::DebugDirLocator;
use symcache::Reason;
use symcache::SymbolOptions;
use symcache::Symbolizer;
use symcache::__private::ElfBuilder;
use symcache::__private::SymSpec;

use tempfile::tempdir;
use test_log::test;


/// Check that binaries registered by build ID are resolved
/// independently of each other.
#[test]
fn build_id_symbolization() {
    let dir = tempdir().unwrap();
    let ids = [
        ("0123456789abcdef", "0123456789abcdef.debug", "foo"),
        ("fedcba9876543210", "fedcba9876543210", "bar"),
    ];

    for (build_id, _file, name) in ids {
        let bytes = (0..build_id.len())
            .step_by(2)
            .map(|idx| u8::from_str_radix(&build_id[idx..idx + 2], 16).unwrap())
            .collect::<Vec<_>>();
        let elf = ElfBuilder::shared_object()
            .build_id(&bytes)
            .symbol(SymSpec::func(name, 0x1000, 0x50))
            .symbol(SymSpec::func("shared_fn", 0x1080, 0x40))
            .build();
        let path = dir.path().join(build_id);
        let () = fs::write(&path, elf).unwrap();
    }

    let debug_dir = dir.path().join("debug");
    for (build_id, file, _name) in ids {
        let build_id_dir = debug_dir.join(".build-id").join(&build_id[..2]);
        let () = fs::create_dir_all(&build_id_dir).unwrap();
        let _size = fs::copy(dir.path().join(build_id), build_id_dir.join(&file[2..])).unwrap();
    }

    let mut symbolizer = Symbolizer::builder().set_debug_dirs([&debug_dir]).build();
    for (build_id, _file, _name) in ids {
        let result = symbolizer
            .resolve_addr(Context::BuildId(build_id), 0x1010)
            .unwrap();
        assert_eq!(result, Err(Reason::UnknownBuildId));
        assert!(symbolizer.add_build_id(&build_id.to_ascii_uppercase()));
    }

    for (build_id, file, name) in ids {
        let sym = symbolizer
            .resolve_addr(Context::BuildId(build_id), 0x1010)
            .unwrap()
            .unwrap();
        assert_eq!(sym.name, name);
        assert_eq!(sym.offset, 0x10);
        assert!(sym.module.unwrap().ends_with(&file[2..]), "{sym:?}");

        let sym = symbolizer
            .resolve_addr(Context::BuildId(build_id), 0x1090)
            .unwrap()
            .unwrap();
        assert_eq!(sym.name, "shared_fn");
        assert!(sym.module.unwrap().ends_with(&file[2..]), "{sym:?}");

        let result = symbolizer
            .resolve_addr(Context::BuildId(build_id), 0x1200)
            .unwrap();
        assert_eq!(result, Err(Reason::UnknownAddr));

        let addr = symbolizer
            .resolve_name(Context::BuildId(build_id), None, name)
            .unwrap();
        assert_eq!(addr, Ok(0x1000));
    }

    let result = symbolizer
        .resolve_name(Context::BuildId("0123456789abcdef"), None, "bar")
        .unwrap();
    assert_eq!(result, Err(Reason::UnknownName));
}

/// Check that binaries without `.note.gnu.build-id` cannot be
/// registered by path, while others are registered under their ID.
#[test]
fn file_registration() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("libbar.so");
    let elf = ElfBuilder::shared_object()
        .build_id(&[0xca, 0xfe, 0xba, 0xbe])
        .symbol(SymSpec::func("bar", 0x2000, 0x10))
        .build();
    let () = fs::write(&path, elf).unwrap();

    let locator = DebugDirLocator::new(Vec::new());
    let mut resolver = BuildIdSymbolResolver::with_locator(locator, SymbolOptions::default());
    assert!(!resolver.add_module("cafebabe"));
    assert_eq!(resolver.add_file(&path).unwrap(), "cafebabe");
    assert!(resolver.contains("cafebabe"));

    let sym = resolver.resolve_addr("cafebabe", 0x2008, false).unwrap();
    assert_eq!(sym.name, "bar");
    assert_eq!(sym.addr, 0x2000);
    assert_eq!(resolver.resolve_name("cafebabe", "bar"), Ok(0x2000));

    let path = dir.path().join("libnoid.so");
    let () = fs::write(&path, ElfBuilder::shared_object().build()).unwrap();
    assert!(resolver.add_file(&path).is_err());
    assert_eq!(resolver.len(), 1);
}
