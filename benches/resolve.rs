use std::fs;
use std::hint::black_box;

use symcache::Addr;
use symcache::BuildIdSymbolResolver;
use symcache::Context;
use symcache::DebugDirLocator;
use symcache::KernelSymbolTable;
use symcache::Pid;
use symcache::SymbolCache as _;
use symcache::SymbolOptions;
use symcache::Symbolizer;
use symcache::__private::ElfBuilder;
use symcache::__private::SymSpec;

use criterion::measurement::Measurement;
use criterion::Bencher;
use criterion::BenchmarkGroup;

use tempfile::tempdir;


/// Resolve addresses in the current process, end-to-end, i.e.,
/// including scanning of the memory map and loading of symbols.
fn resolve_process() {
    let addrs = [
        libc::atexit as *const () as Addr,
        libc::chdir as *const () as Addr,
        libc::fopen as *const () as Addr,
        resolve_process as *const () as Addr,
    ];

    let mut symbolizer = Symbolizer::new();
    for addr in addrs {
        let result = symbolizer
            .resolve_addr(black_box(Context::Process(Pid::Slf)), black_box(addr))
            .unwrap();
        let _sym = black_box(result);
    }
}

/// Resolve an address in the current process, using an already
/// populated cache.
fn resolve_process_cached<M>(b: &mut Bencher<'_, M>)
where
    M: Measurement,
{
    let addr = libc::fopen as *const () as Addr;
    let mut symbolizer = Symbolizer::new();
    let _result = symbolizer
        .resolve_addr(Context::Process(Pid::Slf), addr)
        .unwrap();

    let () = b.iter(|| {
        let result = symbolizer
            .resolve_addr(black_box(Context::Process(Pid::Slf)), black_box(addr))
            .unwrap();
        let _sym = black_box(result);
    });
}

/// Look up a kernel symbol by address, with the table loaded already.
fn resolve_kernel_cached<M>(b: &mut Bencher<'_, M>)
where
    M: Measurement,
{
    let mut table = KernelSymbolTable::new();
    let addr = table.resolve_name(None, "_text").unwrap_or(0);

    let () = b.iter(|| {
        let _result = black_box(table.resolve_addr(black_box(addr + 0x100), false));
    });
}

/// Look up symbols of a synthetic binary by name, with names
/// imported lazily.
fn resolve_build_id_name<M>(b: &mut Bencher<'_, M>)
where
    M: Measurement,
{
    let dir = tempdir().unwrap();
    let path = dir.path().join("libbench.so");
    let elf = (0..1000)
        .fold(
            ElfBuilder::shared_object().build_id(&[0xbe, 0x9c, 0x40, 0x01]),
            |builder, idx| {
                builder.symbol(SymSpec::func(&format!("fn_{idx}"), 0x1000 + idx * 0x10, 0x10))
            },
        )
        .build();
    let () = fs::write(&path, elf).unwrap();

    let locator = DebugDirLocator::new(Vec::new());
    let mut resolver = BuildIdSymbolResolver::with_locator(locator, SymbolOptions::default());
    let build_id = resolver.add_file(&path).unwrap();

    let () = b.iter(|| {
        let addr = resolver.resolve_name(black_box(&build_id), black_box("fn_500"));
        assert_eq!(addr, Ok(0x1000 + 500 * 0x10));
    });
}


pub fn benchmark<M>(group: &mut BenchmarkGroup<'_, M>)
where
    M: Measurement,
{
    bench_fn!(group, resolve_process);
    bench_sub_fn!(group, resolve_process_cached);
    bench_sub_fn!(group, resolve_kernel_cached);
    bench_sub_fn!(group, resolve_build_id_name);
}
