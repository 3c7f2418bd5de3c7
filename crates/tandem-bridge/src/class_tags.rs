//! Class tags for wrapped guest objects
//!
//! A wrapped guest object carries the qualified names of every class in its
//! method-resolution order, most specific first. Builtin classes are
//! reported under the `guest.builtin` prefix.

use tandem_guest::{GuestResult, Interpreter, ObjectId};

use crate::symbols::SymbolCache;

/// Prefix replacing the guest's builtin module name.
pub const BUILTIN_PREFIX: &str = "guest.builtin";

/// Tag carried by every wrapped guest object.
pub const OBJECT_TAG: &str = "guest.builtin.object";

/// Tag added to wrapped iterators and generators.
pub const ITERATOR_TAG: &str = "guest.builtin.iterator";

/// Rewrites the class tags of wrapped objects.
///
/// Installed once per bridge. Any `Fn(Vec<String>) -> Vec<String>` is a
/// filter.
pub trait ClassFilter: Send + Sync {
    fn filter(&self, classes: Vec<String>) -> Vec<String>;
}

impl<F> ClassFilter for F
where
    F: Fn(Vec<String>) -> Vec<String> + Send + Sync,
{
    fn filter(&self, classes: Vec<String>) -> Vec<String> {
        self(classes)
    }
}

/// Leaves tags untouched.
#[derive(Debug, Default, Clone, Copy)]
pub struct KeepAll;

impl ClassFilter for KeepAll {
    fn filter(&self, classes: Vec<String>) -> Vec<String> {
        classes
    }
}

/// Host-side name of a guest class.
pub fn qualified_class_name(interp: &Interpreter, class: ObjectId) -> String {
    let module = interp.type_module(class);
    let name = interp.type_name(class);
    match module.as_str() {
        "" | "builtins" => format!("{}.{}", BUILTIN_PREFIX, name),
        _ => format!("{}.{}", module, name),
    }
}

/// Class tags of `obj`: `extra` (if any) followed by its MRO, always
/// ending in [`OBJECT_TAG`], then passed through `filter`.
pub fn class_tags(
    interp: &Interpreter,
    symbols: &SymbolCache,
    filter: &dyn ClassFilter,
    obj: ObjectId,
    extra: Option<&str>,
) -> GuestResult<Vec<String>> {
    let mut tags: Vec<String> = extra.map(str::to_owned).into_iter().collect();

    if interp.has_attr(obj, "__class__") {
        let class = interp.get_attr(obj, "__class__")?;
        let getmro = symbols.getmro(interp);
        let mro = getmro.and_then(|f| interp.call(f, &[class], &[]));
        interp.dec_ref(class);
        let mro = mro?;
        for base in interp.tuple_items(mro).unwrap_or_default() {
            let tag = qualified_class_name(interp, base);
            if !tags.contains(&tag) {
                tags.push(tag);
            }
        }
        interp.dec_ref(mro);
    }

    if !tags.iter().any(|t| t == OBJECT_TAG) {
        tags.push(OBJECT_TAG.to_owned());
    }
    Ok(filter.filter(tags))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_tags() {
        let interp = Interpreter::new();
        let symbols = SymbolCache::new();
        let d = interp.new_dict();
        let tags = class_tags(&interp, &symbols, &KeepAll, d, None).unwrap();
        assert_eq!(tags, vec!["guest.builtin.dict", "guest.builtin.object"]);
    }

    #[test]
    fn test_user_class_tags_and_filter() {
        let interp = Interpreter::new();
        let symbols = SymbolCache::new();
        let b = interp.builtins().clone();
        let base = interp.new_type("Layer", "nn.layers", &[b.object]).unwrap();
        let dense = interp.new_type("Dense", "nn.layers", &[base]).unwrap();
        let obj = interp.new_instance(dense);

        let tags = class_tags(&interp, &symbols, &KeepAll, obj, Some(ITERATOR_TAG)).unwrap();
        assert_eq!(
            tags,
            vec![
                "guest.builtin.iterator",
                "nn.layers.Dense",
                "nn.layers.Layer",
                "guest.builtin.object"
            ]
        );

        let strip_module = |tags: Vec<String>| -> Vec<String> {
            tags.into_iter().filter(|t| !t.starts_with("nn.")).collect()
        };
        let filtered = class_tags(&interp, &symbols, &strip_module, obj, None).unwrap();
        assert_eq!(filtered, vec!["guest.builtin.object"]);
    }
}
