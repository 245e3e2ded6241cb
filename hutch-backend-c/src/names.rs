//! C identifier mangling. Scope ids (`module:index`) and user names must
//! map to distinct, collision-free C identifiers.

use hutch_ast::instance_class;

/// Mangles a scope id into a C identifier: `:` becomes `_o_` (with `_o_` in
/// the input doubled so the mapping stays injective), module-path dots
/// become `_dot_`. The `[instance]` suffix is stripped; instance records
/// always take the class's name.
pub fn mangle(scope_id: &str) -> String {
    instance_class(scope_id)
        .split(':')
        .map(|part| part.replace("_o_", "_o__o_").replace('.', "_dot_"))
        .collect::<Vec<_>>()
        .join("_o_")
}

/// User variables get an underscore prefix so they can never collide with
/// C keywords or runtime names.
pub fn var(name: &str) -> String {
    format!("_{name}")
}

/// Field name for an anonymous loop slot (`@17` becomes `anon_17`).
pub fn anon_field(name: &str) -> String {
    format!("anon_{}", name.trim_start_matches('@'))
}

/// Struct field for a recorded name: anonymous slots use [`anon_field`],
/// everything else [`var`].
pub fn field(name: &str) -> String {
    if name.starts_with('@') {
        anon_field(name)
    } else {
        var(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mangling_is_injective_on_separators() {
        assert_eq!(mangle("main:3"), "main_o_3");
        assert_ne!(mangle("a_o_b:1"), mangle("a:b:1"));
        assert_eq!(mangle("geo.util:2"), "geo_dot_util_o_2");
    }

    #[test]
    fn instance_suffix_is_stripped() {
        assert_eq!(mangle("main:0[instance]"), mangle("main:0"));
    }

    #[test]
    fn anonymous_slots_become_fields() {
        assert_eq!(field("@17"), "anon_17");
        assert_eq!(field("total"), "_total");
    }
}
