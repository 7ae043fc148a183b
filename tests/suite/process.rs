use std::fs;
use std::fs::File;
use std::io::Write as _;
use std::process::Command;
use std::process::Stdio;
use std::thread::sleep;
use std::time::Duration;

use memmap2::MmapOptions;

use scopeguard::defer;

use symcache::Addr;
use symcache::Context;
use symcache::ModuleType;
use symcache::Pid;
use symcache::ProcessSymbolResolver;
use symcache::Reason;
use symcache::SymbolOptions;
use symcache::Symbolizer;
use symcache::__private::ElfBuilder;
use symcache::__private::SymSpec;

use tempfile::tempdir;
use test_log::test;


#[inline(never)]
#[no_mangle]
extern "C" fn symcache_suite_function() -> usize {
    42
}

#[cfg(feature = "demangle")]
#[inline(never)]
fn suite_rust_function() -> usize {
    1337
}


/// Check that we can symbolize addresses inside a synthetic shared
/// object mapped into our own address space.
#[test]
fn mapped_shared_object() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("libfoobar.so");
    let elf = ElfBuilder::shared_object()
        .text(0x1000, 0x1000, 0x1000)
        .symbol(SymSpec::func("foo", 0x1000, 0x50))
        .symbol(SymSpec::func("bar", 0x1080, 0x40))
        .build();
    let mut file = File::create(&path).unwrap();
    let () = file.write_all(&elf).unwrap();
    let file = File::open(&path).unwrap();

    // SAFETY: The file is private to this test and not modified while
    //         mapped.
    let result = unsafe {
        MmapOptions::new()
            .offset(0x1000)
            .len(0x1000)
            .map_exec(&file)
    };
    let mmap = match result {
        Ok(mmap) => mmap,
        // The temporary directory may reside on a `noexec` file system.
        Err(..) => return,
    };
    let ptr = mmap.as_ptr() as Addr;

    let mut resolver = ProcessSymbolResolver::new(Pid::Slf, SymbolOptions::default()).unwrap();
    let module = resolver
        .modules()
        .find(|module| module.name.ends_with("libfoobar.so"))
        .unwrap();
    assert_eq!(module.module_type, ModuleType::So);
    assert_eq!(module.ranges.len(), 1);
    assert_eq!(module.ranges[0].start, ptr);
    assert_eq!(module.ranges[0].file_offset, 0x1000);

    let sym = resolver.resolve_addr(ptr + 0x90, false).unwrap();
    assert_eq!(sym.name, "bar");
    assert_eq!(sym.addr, ptr + 0x80);
    assert_eq!(sym.offset, 0x10);
    assert_eq!(sym.size, Some(0x40));
    assert!(sym.module.unwrap().ends_with("libfoobar.so"));

    let sym = resolver.resolve_addr(ptr + 0x10, false).unwrap();
    assert_eq!(sym.name, "foo");
    assert_eq!(
        resolver.resolve_addr(ptr + 0x200, false),
        Err(Reason::UnknownAddr)
    );

    assert_eq!(
        resolver.resolve_name(Some("libfoobar.so"), "bar"),
        Ok(ptr + 0x80)
    );
    assert_eq!(
        resolver.resolve_name(Some("libfoobar.so"), "baz"),
        Err(Reason::UnknownName)
    );
    assert_eq!(
        resolver.resolve_name(Some("libdoesnotexist.so"), "bar"),
        Err(Reason::UnknownModule)
    );

    let () = drop(mmap);
    let () = resolver.refresh().unwrap();
    assert!(resolver
        .modules()
        .all(|module| !module.name.ends_with("libfoobar.so")));

    // Some other mapping may have taken over the address range in the
    // meantime, but it can't be ours.
    if let Ok(sym) = resolver.resolve_addr(ptr + 0x90, false) {
        assert!(!sym.module.unwrap_or("").ends_with("libfoobar.so"));
    }
}

/// Check that symbols of another process' modules can still be loaded
/// after it exited.
#[test]
fn exited_process() {
    let mut child = match Command::new("sleep")
        .arg("10")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .spawn()
    {
        Ok(child) => child,
        Err(..) => return,
    };
    let pid = child.id();
    defer!({
        // SAFETY: `libc::kill` is always safe to call.
        let _rc = unsafe { libc::kill(pid as _, libc::SIGKILL) };
    });

    // Wait for the child to have exec'ed.
    let exe = format!("/proc/{pid}/exe");
    for _ in 0..500 {
        match fs::read_link(&exe) {
            Ok(path) if path.ends_with("sleep") => break,
            _ => sleep(Duration::from_millis(10)),
        }
    }

    let options = SymbolOptions {
        auto_refresh: false,
        ..Default::default()
    };
    let mut resolver = ProcessSymbolResolver::new(Pid::from(pid), options).unwrap();
    let () = child.kill().unwrap();
    let _status = child.wait().unwrap();

    let libc = resolver
        .modules()
        .find(|module| module.name.contains("libc.so"))
        .map(|module| module.name.to_string());
    // `sleep` may be linked statically.
    let libc = match libc {
        Some(libc) => libc,
        None => return,
    };

    let addr = resolver.resolve_name(Some(&libc), "malloc").unwrap();
    let sym = resolver.resolve_addr(addr, false).unwrap();
    assert_eq!(sym.module, Some(libc.as_str()));
    assert_eq!(sym.offset, 0);
}

/// Check that the symbolizer resolves functions of our own process.
#[test]
fn symbolize_self() {
    let addr = symcache_suite_function as Addr;
    assert_eq!(symcache_suite_function(), 42);

    let mut symbolizer = Symbolizer::new();
    let sym = symbolizer
        .resolve_addr(Context::Process(Pid::Slf), addr)
        .unwrap()
        .unwrap();
    assert_eq!(sym.name, "symcache_suite_function");
    assert_eq!(sym.addr, addr);
    assert_eq!(sym.offset, 0);

    let sym = symbolizer
        .resolve_addr(Context::Process(Pid::Slf), addr + 1)
        .unwrap()
        .unwrap();
    assert_eq!(sym.name, "symcache_suite_function");
    assert_eq!(sym.offset, 1);

    let resolved = symbolizer
        .resolve_name(Context::Process(Pid::Slf), None, "symcache_suite_function")
        .unwrap();
    assert_eq!(resolved, Ok(addr));

    let () = symbolizer.refresh(Context::Process(Pid::Slf)).unwrap();
    assert!(symbolizer.forget_process(Pid::Slf));
    assert!(!symbolizer.forget_process(Pid::Slf));
}

/// Check that Rust symbols get demangled if requested.
#[cfg(feature = "demangle")]
#[test]
fn demangle_rust() {
    let addr = suite_rust_function as Addr;
    assert_eq!(suite_rust_function(), 1337);

    let mut symbolizer = Symbolizer::builder().enable_demangling(true).build();
    let sym = symbolizer
        .resolve_addr(Context::Process(Pid::Slf), addr)
        .unwrap()
        .unwrap();
    assert!(
        sym.name.ends_with("process::suite_rust_function"),
        "{}",
        sym.name
    );

    let mut symbolizer = Symbolizer::builder().enable_demangling(false).build();
    let sym = symbolizer
        .resolve_addr(Context::Process(Pid::Slf), addr)
        .unwrap()
        .unwrap();
    assert!(!sym.name.contains("::"), "{}", sym.name);
    assert!(sym.name.contains("suite_rust_function"), "{}", sym.name);
}
