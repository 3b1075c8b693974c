//! Symbol-name mangling for generated identifiers.
//!
//! `foo-bar!` becomes `_foo_45_bar_33_`: a leading underscore, letters,
//! digits, and literal underscores kept, every other code point expanded
//! to `_<decimal>_`.  Symbols are case-insensitive, so names are mangled
//! from their lowercase spelling; distinct symbols that would still
//! collide (an escaped `a_45_b` vs. `a-b`) are disambiguated by the
//! generator's per-scope counter suffix.

pub fn mangle(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 4);
    out.push('_');
    for c in name.to_lowercase().chars() {
        if c.is_ascii_alphanumeric() || c == '_' {
            out.push(c);
        } else {
            out.push('_');
            out.push_str(&(c as u32).to_string());
            out.push('_');
        }
    }
    out
}

/// A crate-name-safe rendering of a unit name.
pub fn crate_name(unit: &str) -> String {
    let mut out = String::with_capacity(unit.len());
    for c in unit.chars() {
        if c.is_ascii_alphanumeric() || c == '_' {
            out.push(c);
        } else {
            out.push('_');
        }
    }
    if out.is_empty() || out.chars().next().is_some_and(|c| c.is_ascii_digit()) {
        out.insert(0, 'p');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expands_non_identifier_chars() {
        assert_eq!(mangle("foo-bar!"), "_foo_45_bar_33_");
        assert_eq!(mangle("x"), "_x");
        assert_eq!(mangle("*global*"), "_42_global_42_");
        assert_eq!(mangle("a_b"), "_a_b");
        assert_eq!(mangle("+"), "_43_");
    }

    #[test]
    fn case_insensitive_names_mangle_identically() {
        assert_eq!(mangle("Foo-Bar"), mangle("foo-bar"));
    }

    #[test]
    fn output_is_a_rust_identifier() {
        for name in ["foo-bar!", "<=", "list*", "1+", "a.b.c", "π"] {
            let mangled = mangle(name);
            assert!(mangled.starts_with('_'));
            assert!(
                mangled.chars().all(|c| c.is_ascii_alphanumeric() || c == '_'),
                "{} -> {}",
                name,
                mangled
            );
        }
    }

    #[test]
    fn crate_names_are_safe() {
        assert_eq!(crate_name("my-unit"), "my_unit");
        assert_eq!(crate_name("9lives"), "p9lives");
        assert_eq!(crate_name(""), "p");
    }
}
