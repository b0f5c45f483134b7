//! Kind reference resolution and API discovery bookkeeping.
//!
//! A user-supplied kind reference (`pod`, `Pod`, `po`, `pods/v1`,
//! `ingress.networking.k8s.io/v1`, `role.v1.rbac.authorization.k8s.io`) is
//! parsed into a [`KindRef`] and resolved against the [`Registry`] of known
//! classes: the built-in table, anything learned from server discovery, and
//! ad-hoc registrations.
use std::cmp::Ordering;

use crate::{Error, Result};

/// A parsed kind reference: `(kind, group, version)`, all lowercased.
///
/// `kind` may be the kind, the singular, or the plural name; `group` and
/// `version` are empty when the reference leaves them open.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KindRef {
    /// kind | singular | plural, lowercased
    pub kind: String,
    /// api group, possibly empty
    pub group: String,
    /// version token, possibly empty
    pub version: String,
}

/// Parse a kind reference.
///
/// Split on the first `/` into `(head, version)`; split head on the first `.`
/// into `(kind, group)`. If the leading group segment looks like a version
/// (`v<digit>[a-z0-9]*`) and no version was given, it is promoted to the
/// version and the remainder becomes the group.
pub fn parse_kind(reference: &str) -> KindRef {
    let (head, version) = match reference.split_once('/') {
        Some((head, version)) => (head, version),
        None => (reference, ""),
    };
    let (kind, group) = match head.split_once('.') {
        Some((kind, group)) => (kind, group),
        None => (head, ""),
    };
    let mut version = version.to_string();
    let mut group = group.to_string();
    if version.is_empty() {
        if let Some((first, rest)) = group.split_once('.') {
            if is_version_token(first) {
                version = first.to_string();
                group = rest.to_string();
            }
        }
    }
    KindRef {
        kind: kind.to_ascii_lowercase(),
        group: group.to_ascii_lowercase(),
        version: version.to_ascii_lowercase(),
    }
}

fn is_version_token(s: &str) -> bool {
    let mut chars = s.chars();
    if chars.next() != Some('v') {
        return false;
    }
    match chars.next() {
        Some(c) if c.is_ascii_digit() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
}

/// Class-level description of an addressable resource.
///
/// Enough information to build request paths and default document fields for
/// any instance of the kind. Built-ins are listed statically; discovery and
/// [`ObjectClass::dynamic`] produce the rest at runtime.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectClass {
    /// API group, empty for the core group
    pub group: String,
    /// Version token (`v1`, `v1beta1`, ...)
    pub version: String,
    /// CamelCase kind
    pub kind: String,
    /// Plural path segment
    pub plural: String,
    /// Singular name
    pub singular: String,
    /// Whether instances live in a namespace
    pub namespaced: bool,
    /// Whether the kind supports the scale flow
    pub scalable: bool,
    /// Dotted path under `spec` patched when scaling
    pub scalable_path: String,
}

impl ObjectClass {
    /// A builtin class definition.
    pub(crate) fn builtin(
        group: &str,
        version: &str,
        kind: &str,
        plural: &str,
        singular: &str,
        namespaced: bool,
    ) -> ObjectClass {
        ObjectClass {
            group: group.into(),
            version: version.into(),
            kind: kind.into(),
            plural: plural.into(),
            singular: singular.into(),
            namespaced,
            scalable: false,
            scalable_path: "replicas".into(),
        }
    }

    /// Construct a class for a kind not present in the registry.
    ///
    /// `api_version` accepts `v1`, `group/version`, or a bare group (which
    /// gets `v1`). `plural` is guessed when not provided.
    pub fn dynamic(kind: &str, api_version: Option<&str>, namespaced: bool) -> ObjectClass {
        let (mut kind, mut api_version) = (kind.to_string(), api_version.map(String::from));
        if let Some(dot) = kind.find('.') {
            let rest = kind[dot + 1..].to_string();
            kind.truncate(dot);
            if api_version.is_none() {
                api_version = Some(rest);
            }
        }
        let (group, version) = match api_version.as_deref() {
            None => (String::new(), "v1".to_string()),
            Some(av) => match av.split_once('/') {
                Some((g, v)) => (g.to_string(), v.to_string()),
                None => {
                    if is_version_token(av) {
                        (String::new(), av.to_string())
                    } else {
                        (av.to_string(), "v1".to_string())
                    }
                }
            },
        };
        let singular = kind.to_ascii_lowercase();
        ObjectClass {
            group,
            version,
            plural: to_plural(&singular),
            singular,
            kind,
            namespaced,
            scalable: false,
            scalable_path: "replicas".into(),
        }
    }

    /// Override the plural path segment.
    pub fn plural(mut self, plural: &str) -> ObjectClass {
        self.plural = plural.to_ascii_lowercase();
        self
    }

    /// Mark the class scalable through the given dotted path under `spec`.
    pub fn scalable(mut self, path: &str) -> ObjectClass {
        self.scalable = true;
        self.scalable_path = path.into();
        self
    }

    /// The `apiVersion` document field for this class.
    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }

    /// The url prefix for this class in an optional namespace:
    /// `/api/v1` or `/apis/<group>/<version>`, plus `/namespaces/<ns>`.
    pub fn url_base(&self, namespace: Option<&str>) -> String {
        let mut url = if self.group.is_empty() {
            format!("/api/{}", self.version)
        } else {
            format!("/apis/{}/{}", self.group, self.version)
        };
        if self.namespaced {
            if let Some(ns) = namespace {
                url.push_str("/namespaces/");
                url.push_str(ns);
            }
        }
        url
    }

    /// The collection url for this class in an optional namespace.
    pub fn url_path(&self, namespace: Option<&str>) -> String {
        format!("{}/{}", self.url_base(namespace), self.plural)
    }
}

/// A registered class plus the discovery aliases it answers to.
#[derive(Debug, Clone)]
pub struct RegistryEntry {
    /// The class itself
    pub class: ObjectClass,
    /// Short names from discovery (`po`, `svc`, ...)
    pub short_names: Vec<String>,
    /// Whether this entry came from server discovery (dropped on rebuild)
    pub discovered: bool,
}

/// Table of resolvable classes: built-ins first, then discovered and
/// user-registered classes, so later registrations win lookup ties.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    entries: Vec<RegistryEntry>,
}

impl Registry {
    /// An empty registry.
    pub fn new() -> Registry {
        Registry::default()
    }

    /// A registry preloaded with the built-in kinds.
    pub fn builtin() -> Registry {
        let mut registry = Registry::new();
        for class in crate::api::builtin_classes() {
            registry.register(class, vec![]);
        }
        registry
    }

    /// Register a class, optionally with discovery short names.
    pub fn register(&mut self, class: ObjectClass, short_names: Vec<String>) {
        self.entries.push(RegistryEntry {
            class,
            short_names,
            discovered: false,
        });
    }

    /// Register a class learned from server discovery.
    ///
    /// Skips duplicates so repeated discovery passes don't grow the table.
    pub fn register_discovered(&mut self, class: ObjectClass, short_names: Vec<String>) {
        if self
            .entries
            .iter()
            .any(|e| e.class.group == class.group && e.class.version == class.version && e.class.plural == class.plural)
        {
            return;
        }
        self.entries.push(RegistryEntry {
            class,
            short_names,
            discovered: true,
        });
    }

    /// Drop everything learned from discovery, keeping built-ins and user
    /// registrations.
    pub fn clear_discovered(&mut self) {
        self.entries.retain(|e| !e.discovered);
    }

    /// Whether any class for the given group is registered.
    pub fn has_group(&self, group: &str) -> bool {
        self.entries.iter().any(|e| e.class.group == group)
    }

    /// Resolve a parsed reference against the registered classes.
    ///
    /// Matches kind, singular, plural, or a discovery short name; a group or
    /// version named by the reference must agree. The last match wins, so
    /// user registrations shadow built-ins.
    pub fn lookup(&self, reference: &KindRef) -> Option<&ObjectClass> {
        let mut result = None;
        for entry in &self.entries {
            let class = &entry.class;
            let name_matches = class.kind.to_ascii_lowercase() == reference.kind
                || class.singular == reference.kind
                || class.plural == reference.kind
                || entry.short_names.iter().any(|s| s == &reference.kind);
            if !name_matches {
                continue;
            }
            if !reference.group.is_empty() && class.group != reference.group {
                continue;
            }
            if !reference.version.is_empty() && class.version != reference.version {
                continue;
            }
            result = Some(class);
        }
        result
    }

    /// Resolve a reference string, or fail with `KindUnknown`.
    pub fn lookup_str(&self, reference: &str) -> Result<ObjectClass> {
        self.lookup(&parse_kind(reference))
            .cloned()
            .ok_or_else(|| Error::KindUnknown(reference.to_string()))
    }
}

/// Sort versions by priority: GA versions first (numeric descending), then
/// beta, then alpha (same order within), then everything else
/// lexicographically. Equal keys keep their input order.
pub fn sort_versions(versions: &mut [String]) {
    versions.sort_by(|a, b| compare_version_priority(a, b));
}

/// Priority comparison between two version tokens, highest priority first.
pub fn compare_version_priority(a: &str, b: &str) -> Ordering {
    match (parse_version(a), parse_version(b)) {
        (Some(pa), Some(pb)) => pb.cmp(&pa),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => a.cmp(b),
    }
}

// (stability, major, minor): GA > beta > alpha, then numerically descending.
fn parse_version(v: &str) -> Option<(u8, u64, u64)> {
    let rest = v.strip_prefix('v')?;
    let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        return None;
    }
    let major: u64 = digits.parse().ok()?;
    let suffix = &rest[digits.len()..];
    if suffix.is_empty() {
        return Some((3, major, 0));
    }
    for (tag, rank) in &[("beta", 2u8), ("alpha", 1u8)] {
        if let Some(minor) = suffix.strip_prefix(tag) {
            if minor.is_empty() {
                return Some((*rank, major, 0));
            }
            if let Ok(n) = minor.parse::<u64>() {
                return Some((*rank, major, n));
            }
            return None;
        }
    }
    None
}

/// Guess the plural path segment for a singular name.
///
/// Handles the irregular endings that show up in the native API surface;
/// discovery overrides the guess whenever the server knows better.
pub fn to_plural(word: &str) -> String {
    if word == "endpoints" || word == "endpointslices" {
        return word.to_owned();
    }

    // Words ending in s, x, z, ch, sh are pluralized with -es (eg. foxes).
    if word.ends_with('s')
        || word.ends_with('x')
        || word.ends_with('z')
        || word.ends_with("ch")
        || word.ends_with("sh")
    {
        return format!("{}es", word);
    }

    // Words ending in y preceded by a consonant get -ies (eg. puppies).
    if word.ends_with('y') {
        if let Some(c) = word.chars().nth(word.len() - 2) {
            if !matches!(c, 'a' | 'e' | 'i' | 'o' | 'u') {
                let mut chars = word.chars();
                chars.next_back();
                return format!("{}ies", chars.as_str());
            }
        }
    }

    format!("{}s", word)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_kind_accepted_forms() {
        assert_eq!(parse_kind("Pod"), KindRef {
            kind: "pod".into(),
            group: "".into(),
            version: "".into()
        });
        assert_eq!(parse_kind("deployment"), KindRef {
            kind: "deployment".into(),
            group: "".into(),
            version: "".into()
        });
        assert_eq!(parse_kind("services/v1"), KindRef {
            kind: "services".into(),
            group: "".into(),
            version: "v1".into()
        });
        assert_eq!(parse_kind("ingress.networking.k8s.io/v1"), KindRef {
            kind: "ingress".into(),
            group: "networking.k8s.io".into(),
            version: "v1".into()
        });
        assert_eq!(parse_kind("role.v1.rbac.authorization.k8s.io"), KindRef {
            kind: "role".into(),
            group: "rbac.authorization.k8s.io".into(),
            version: "v1".into()
        });
    }

    #[test]
    fn parse_kind_is_idempotent_on_reparse() {
        for input in &["Pod", "pods/v1", "ingress.networking.k8s.io/v1"] {
            let parsed = parse_kind(input);
            let rendered = if parsed.version.is_empty() {
                parsed.kind.clone()
            } else if parsed.group.is_empty() {
                format!("{}/{}", parsed.kind, parsed.version)
            } else {
                format!("{}.{}/{}", parsed.kind, parsed.group, parsed.version)
            };
            assert_eq!(parse_kind(&rendered), parsed);
        }
    }

    #[test]
    fn version_promotion_requires_version_shape() {
        // "example" is not a version token, so it stays in the group
        let parsed = parse_kind("widget.example.com");
        assert_eq!(parsed.group, "example.com");
        assert_eq!(parsed.version, "");
    }

    #[test]
    fn version_priority_order() {
        let mut versions: Vec<String> = vec![
            "v11alpha2", "foo10", "v10", "v11beta0", "v1", "v3beta1", "v2", "foo1", "v10beta3",
            "v12alpha1", "v1alpha1",
        ]
        .into_iter()
        .map(String::from)
        .collect();
        sort_versions(&mut versions);
        assert_eq!(
            versions,
            vec![
                "v10", "v2", "v1", "v11beta0", "v10beta3", "v3beta1", "v12alpha1", "v11alpha2",
                "v1alpha1", "foo1", "foo10",
            ]
        );
    }

    #[test]
    fn pluralization() {
        for (singular, plural) in &[
            ("pod", "pods"),
            ("ingress", "ingresses"),
            ("networkpolicy", "networkpolicies"),
            ("componentstatus", "componentstatuses"),
            ("endpoints", "endpoints"),
            ("box", "boxes"),
            ("day", "days"),
        ] {
            assert_eq!(to_plural(singular), *plural);
        }
    }

    #[test]
    fn registry_lookup_matches_all_name_forms() {
        let registry = Registry::builtin();
        for reference in &["pod", "pods", "Pod", "pod/v1"] {
            let class = registry.lookup_str(reference).unwrap();
            assert_eq!(class.kind, "Pod");
            assert_eq!(class.plural, "pods");
        }
        let ing = registry.lookup_str("ingress.networking.k8s.io/v1").unwrap();
        assert_eq!(ing.kind, "Ingress");
        assert_eq!(ing.group, "networking.k8s.io");
        assert!(registry.lookup_str("definitelynotakind").is_err());
        // version mismatch is a miss
        assert!(registry.lookup_str("pod/v2").is_err());
    }

    #[test]
    fn registry_later_registrations_win() {
        let mut registry = Registry::builtin();
        let custom = ObjectClass::dynamic("Pod", Some("example.com/v2"), true);
        registry.register(custom, vec![]);
        let class = registry.lookup_str("pod.example.com").unwrap();
        assert_eq!(class.version, "v2");
        // unqualified lookups now resolve to the last registration
        let class = registry.lookup_str("pod").unwrap();
        assert_eq!(class.group, "example.com");
    }

    #[test]
    fn dynamic_class_defaults() {
        let class = ObjectClass::dynamic("Widget", None, true);
        assert_eq!(class.api_version(), "v1");
        assert_eq!(class.plural, "widgets");
        assert_eq!(class.url_path(Some("ns")), "/api/v1/namespaces/ns/widgets");

        let class = ObjectClass::dynamic("Cheese", Some("dairy.example.com/v1beta1"), false);
        assert_eq!(class.api_version(), "dairy.example.com/v1beta1");
        assert_eq!(class.url_path(None), "/apis/dairy.example.com/v1beta1/cheeses");
    }
}
