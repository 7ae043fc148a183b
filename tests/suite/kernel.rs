use std::fs;

use symcache::Context;
use symcache::KernelSymbolTable;
use symcache::Reason;
use symcache::SymbolCache as _;
use symcache::Symbolizer;
use symcache::KALLSYMS;

use anyhow::Result;

use tempfile::tempdir;
use test_log::test;


/// Check that we can symbolize addresses using a kallsyms copy.
#[test]
fn kallsyms_copy() -> Result<()> {
    let dir = tempdir()?;
    let kallsyms = dir.path().join("kallsyms");
    let () = fs::write(
        &kallsyms,
        br#"ffffffff81000000 T _stext
ffffffff81000000 T _text
ffffffff81001000 D some_data
ffffffff81002000 t local_fn
ffffffff81002100 W weak_fn
ffffffffc0279000 t module_fn	[some_mod]
"#,
    )?;

    let mut symbolizer = Symbolizer::builder().set_kallsyms(&kallsyms).build();
    let sym = symbolizer
        .resolve_addr(Context::Kernel, 0xffffffff81002010)?
        .unwrap();
    assert_eq!(sym.name, "local_fn");
    assert_eq!(sym.offset, 0x10);
    assert_eq!(sym.module, None);

    let sym = symbolizer
        .resolve_addr(Context::Kernel, 0xffffffffc0279008)?
        .unwrap();
    assert_eq!(sym.name, "module_fn");
    assert_eq!(sym.module, Some("some_mod"));

    let result = symbolizer.resolve_addr(Context::Kernel, 0xffffffff80000000)?;
    assert_eq!(result, Err(Reason::UnknownAddr));

    let addr = symbolizer.resolve_name(Context::Kernel, None, "weak_fn")?;
    assert_eq!(addr, Ok(0xffffffff81002100));
    let addr = symbolizer.resolve_name(Context::Kernel, None, "some_data")?;
    assert_eq!(addr, Err(Reason::UnknownName));
    Ok(())
}

/// Check that names and addresses of the running kernel round-trip, if
/// addresses are visible to us.
#[test]
fn running_kernel() {
    let mut table = KernelSymbolTable::new();
    assert_eq!(table.path().to_str(), Some(KALLSYMS));

    let addr = match table.resolve_name(None, "_text") {
        Ok(addr) => addr,
        // Addresses are hidden without the necessary privileges.
        Err(..) => return,
    };

    let sym = table.resolve_addr(addr, false).unwrap();
    assert_eq!(sym.addr, addr);
    assert_eq!(sym.offset, 0);
    let name = sym.name.to_string();
    assert_eq!(table.resolve_name(None, &name), Ok(addr));
}
