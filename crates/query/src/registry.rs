//! Per-kind predicate and comparator pairs.
//!
//! Each kind registers a [`KindPolicy`]: a filter function, a comparator and the
//! filter vocabulary its accessor accepts. Fields a policy does not handle itself fall
//! through to the common metadata policy, which never fails: unknown filter fields match
//! everything and unknown sort fields order by creation time.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use appdeck_core::{Field, Filter, Kind, ResourceObject};

pub type FilterFn = fn(&ResourceObject, &Filter) -> bool;
pub type CompareFn = fn(&ResourceObject, &ResourceObject, &Field) -> Ordering;

#[derive(Clone, Copy)]
pub struct KindPolicy {
    pub filter: FilterFn,
    pub compare: CompareFn,
    /// Filter fields the accessor accepts for this kind.
    pub fields: &'static [Field],
}

impl KindPolicy {
    pub fn matches(&self, obj: &ResourceObject, filter: &Filter) -> bool { (self.filter)(obj, filter) }

    pub fn compare(&self, a: &ResourceObject, b: &ResourceObject, field: &Field) -> Ordering { (self.compare)(a, b, field) }

    pub fn accepts(&self, field: &Field) -> bool { self.fields.contains(field) }
}

impl std::fmt::Debug for KindPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KindPolicy").field("fields", &self.fields).finish_non_exhaustive()
    }
}

/// Filter vocabulary shared by the application kinds.
pub static APPLICATION_FIELDS: &[Field] = &[
    Field::Name,
    Field::Names,
    Field::Uid,
    Field::Namespace,
    Field::OwnerReference,
    Field::OwnerKind,
    Field::Annotation,
    Field::Label,
    Field::Status,
    Field::CreateTime,
];

/// Policy used for kinds without a registration.
pub static METADATA_POLICY: KindPolicy =
    KindPolicy { filter: object_meta_filter, compare: object_meta_compare, fields: APPLICATION_FIELDS };

/// Policy for application-like resources: `name` and `status` read `spec.name` and
/// the reported state, everything else is metadata.
pub static DISPLAY_NAME_POLICY: KindPolicy =
    KindPolicy { filter: display_name_filter, compare: display_name_compare, fields: APPLICATION_FIELDS };

/// Kind-tagged dispatch table.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    policies: BTreeMap<Kind, KindPolicy>,
}

impl Registry {
    pub fn new() -> Self { Self::default() }

    /// Registry with the built-in application, application version and release policies.
    pub fn with_defaults() -> Self {
        let mut r = Self::new();
        r.register(Kind::Application, DISPLAY_NAME_POLICY);
        r.register(Kind::ApplicationVersion, DISPLAY_NAME_POLICY);
        r.register(Kind::Release, DISPLAY_NAME_POLICY);
        r
    }

    pub fn register(&mut self, kind: Kind, policy: KindPolicy) -> &mut Self {
        self.policies.insert(kind, policy);
        self
    }

    pub fn policy(&self, kind: Kind) -> Option<&KindPolicy> { self.policies.get(&kind) }

    pub fn kinds(&self) -> impl Iterator<Item = Kind> + '_ { self.policies.keys().copied() }

    pub fn matches(&self, kind: Kind, obj: &ResourceObject, filter: &Filter) -> bool {
        self.policy(kind).unwrap_or(&METADATA_POLICY).matches(obj, filter)
    }

    pub fn compare(&self, kind: Kind, a: &ResourceObject, b: &ResourceObject, field: &Field) -> Ordering {
        self.policy(kind).unwrap_or(&METADATA_POLICY).compare(a, b, field)
    }
}

pub fn display_name_filter(obj: &ResourceObject, filter: &Filter) -> bool {
    match filter.field {
        Field::Name => obj.display_name.contains(filter.value.as_str()),
        Field::Status => obj.state.contains(filter.value.as_str()),
        _ => object_meta_filter(obj, filter),
    }
}

/// Name order is reverse lexicographic: `a` sorts after `b`.
pub fn display_name_compare(a: &ResourceObject, b: &ResourceObject, field: &Field) -> Ordering {
    match field {
        Field::Name => b.display_name.cmp(&a.display_name),
        _ => object_meta_compare(a, b, field),
    }
}

/// Common metadata filter.
pub fn object_meta_filter(obj: &ResourceObject, filter: &Filter) -> bool {
    let value = filter.value.as_str();
    match &filter.field {
        Field::Names => value.split(',').any(|n| n == obj.name),
        Field::Name => obj.name.contains(value),
        Field::Uid => obj.uid == value,
        Field::Namespace => obj.namespace.as_deref().unwrap_or("") == value,
        Field::OwnerReference => obj.owner_refs.iter().any(|o| o.uid == value),
        Field::OwnerKind => obj.owner_refs.iter().any(|o| o.kind == value),
        Field::Annotation => label_match(&obj.annotations, value),
        Field::Label => label_match(&obj.labels, value),
        Field::Status => obj.state.contains(value),
        Field::CreateTime | Field::Other(_) => true,
    }
}

/// Ascending creation time, ties broken by name; used for every field.
pub fn object_meta_compare(a: &ResourceObject, b: &ResourceObject, _field: &Field) -> Ordering {
    a.creation_ts.cmp(&b.creation_ts).then_with(|| a.name.cmp(&b.name))
}

/// `key` (exists), `key=value` (equals) or `key!=value` (key present with another value).
pub fn label_match(pairs: &[(String, String)], filter: &str) -> bool {
    let (key, value, negate) = match filter.split_once('=') {
        Some((k, v)) => match k.strip_suffix('!') {
            Some(k) => (k, Some(v), true),
            None => (k, Some(v), false),
        },
        None => (filter, None, false),
    };
    pairs.iter().any(|(k, v)| {
        k == key
            && match (value, negate) {
                (None, _) => true,
                (Some(want), false) => v == want,
                (Some(want), true) => v != want,
            }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn obj(name: &str) -> ResourceObject { ResourceObject::new(Kind::Application, name) }

    #[test]
    fn name_filter_is_case_sensitive_substring_of_display_name() {
        let o = obj("app-1").with_display_name("Nginx-Ingress");
        assert!(display_name_filter(&o, &Filter::new("name", "Ingress")));
        assert!(!display_name_filter(&o, &Filter::new("name", "ingress")));
        // metadata name is not consulted for `name`
        assert!(!display_name_filter(&o, &Filter::new("name", "app-1")));
    }

    #[test]
    fn status_filter_is_substring() {
        let o = obj("a").with_state("Active");
        assert!(display_name_filter(&o, &Filter::new("status", "Act")));
        assert!(!display_name_filter(&o, &Filter::new("status", "active")));
    }

    #[test]
    fn metadata_filters() {
        let mut o = obj("a").with_label("tier", "web");
        o.uid = "u-1".into();
        o.namespace = Some("demo".into());
        o.owner_refs.push(appdeck_core::OwnerRef { uid: "o-1".into(), kind: "Workspace".into() });
        assert!(object_meta_filter(&o, &Filter::new("names", "x,a,y")));
        assert!(!object_meta_filter(&o, &Filter::new("names", "aa")));
        assert!(object_meta_filter(&o, &Filter::new("uid", "u-1")));
        assert!(object_meta_filter(&o, &Filter::new("namespace", "demo")));
        assert!(object_meta_filter(&o, &Filter::new("ownerReference", "o-1")));
        assert!(object_meta_filter(&o, &Filter::new("ownerKind", "Workspace")));
        assert!(object_meta_filter(&o, &Filter::new("label", "tier=web")));
        assert!(object_meta_filter(&o, &Filter::new("label", "tier")));
        assert!(object_meta_filter(&o, &Filter::new("label", "tier!=db")));
        assert!(!object_meta_filter(&o, &Filter::new("label", "tier!=web")));
        assert!(!object_meta_filter(&o, &Filter::new("annotation", "tier")));
        // unknown fields degrade to match-all
        assert!(object_meta_filter(&o, &Filter::new("color", "blue")));
    }

    #[test]
    fn name_compare_is_reverse_lexicographic() {
        let (a, b) = (obj("a"), obj("b"));
        assert_eq!(display_name_compare(&a, &b, &Field::Name), Ordering::Greater);
        assert_eq!(display_name_compare(&b, &a, &Field::Name), Ordering::Less);
    }

    #[test]
    fn fallback_compare_by_creation_then_name() {
        let a = obj("b").with_creation_ts(1);
        let b = obj("a").with_creation_ts(2);
        let c = obj("a").with_creation_ts(1);
        assert_eq!(display_name_compare(&a, &b, &Field::CreateTime), Ordering::Less);
        assert_eq!(display_name_compare(&c, &a, &Field::Other("whatever".into())), Ordering::Less);
    }

    #[test]
    fn unregistered_kind_uses_metadata_policy() {
        let r = Registry::new();
        let o = obj("nginx").with_display_name("other");
        assert!(r.matches(Kind::Release, &o, &Filter::new("name", "ngi")));
        let d = Registry::with_defaults();
        assert!(!d.matches(Kind::Release, &o, &Filter::new("name", "ngi")));
        assert_eq!(d.kinds().count(), 3);
    }
}
