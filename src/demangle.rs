use std::borrow::Cow;


#[cfg(feature = "demangle")]
fn demangle_impl(name: &str) -> Option<String> {
    // Rust symbols using the legacy mangling scheme also parse as C++
    // symbols (with a hash suffix), so try Rust first.
    rustc_demangle::try_demangle(name)
        .map(|x| format!("{x:#}"))
        .ok()
        .or_else(|| {
            cpp_demangle::Symbol::new(name)
                .ok()
                .and_then(|sym| sym.demangle(&Default::default()).ok())
        })
}

#[cfg(not(feature = "demangle"))]
fn demangle_impl(_name: &str) -> Option<String> {
    None
}


/// Demangle `name` if requested and possible, falling back to the
/// name as-is otherwise.
pub(crate) fn maybe_demangle(name: &str, demangle: bool) -> Cow<'_, str> {
    if !demangle {
        return Cow::Borrowed(name)
    }

    match demangle_impl(name) {
        Some(demangled) => Cow::Owned(demangled),
        None => Cow::Borrowed(name),
    }
}
