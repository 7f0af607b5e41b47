use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::ops::{Add, AddAssign};

use crate::quantity::Quantity;

/// A map of resource name to quantity, e.g. a quota's `hard` or a grant's
/// `additional`. Missing entries read as zero.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceList(BTreeMap<String, Quantity>);

impl ResourceList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert, handy for tests and fixtures.
    pub fn with(mut self, name: &str, quantity: Quantity) -> Self {
        self.0.insert(name.to_string(), quantity);
        self
    }

    pub fn get(&self, name: &str) -> Quantity {
        self.0.get(name).copied().unwrap_or_default()
    }

    /// `None` when the name is not enumerated at all.
    pub fn lookup(&self, name: &str) -> Option<Quantity> {
        self.0.get(name).copied()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    pub fn insert(&mut self, name: impl Into<String>, quantity: Quantity) {
        self.0.insert(name.into(), quantity);
    }

    pub fn remove(&mut self, name: &str) -> Option<Quantity> {
        self.0.remove(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, Quantity)> {
        self.0.iter().map(|(k, v)| (k.as_str(), *v))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True when every entry is zero (or there are none).
    pub fn is_all_zero(&self) -> bool {
        self.0.values().all(Quantity::is_zero)
    }

    /// Drops entries that are zero or negative.
    pub fn positive(&self) -> ResourceList {
        self.0
            .iter()
            .filter(|(_, q)| q.is_positive())
            .map(|(k, q)| (k.clone(), *q))
            .collect()
    }

    /// Per-entry `self - rhs`, clamped at zero. Names only in `rhs` are ignored.
    pub fn sub_clamped(&self, rhs: &ResourceList) -> ResourceList {
        self.0
            .iter()
            .map(|(k, q)| (k.clone(), q.sub_clamped(rhs.get(k))))
            .collect()
    }

    /// Names whose quantity exceeds the same name in `limit`.
    pub fn exceeding<'a>(&'a self, limit: &'a ResourceList) -> impl Iterator<Item = &'a str> {
        self.0
            .iter()
            .filter(move |(k, q)| **q > limit.get(k))
            .map(|(k, _)| k.as_str())
    }
}

impl Add<&ResourceList> for ResourceList {
    type Output = ResourceList;

    fn add(mut self, rhs: &ResourceList) -> Self::Output {
        self += rhs;
        self
    }
}

impl AddAssign<&ResourceList> for ResourceList {
    fn add_assign(&mut self, rhs: &ResourceList) {
        for (name, q) in &rhs.0 {
            *self.0.entry(name.clone()).or_default() += *q;
        }
    }
}

impl<'a> std::iter::Sum<&'a ResourceList> for ResourceList {
    fn sum<I: Iterator<Item = &'a ResourceList>>(iter: I) -> Self {
        iter.fold(ResourceList::default(), |acc, r| acc + r)
    }
}

impl FromIterator<(String, Quantity)> for ResourceList {
    fn from_iter<T: IntoIterator<Item = (String, Quantity)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl fmt::Display for ResourceList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.0.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
        write!(f, "{{{}}}", parts.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn q(s: &str) -> Quantity {
        s.parse().unwrap()
    }

    #[test]
    fn missing_entries_read_as_zero() {
        let list = ResourceList::new().with("memory", q("1Gi"));
        assert_eq!(list.get("cpu"), Quantity::ZERO);
        assert_eq!(list.lookup("cpu"), None);
        assert_eq!(list.lookup("memory"), Some(q("1Gi")));
    }

    #[test]
    fn add_merges_names() {
        let a = ResourceList::new().with("cpu", q("1")).with("memory", q("1Gi"));
        let b = ResourceList::new().with("cpu", q("500m"));
        let sum = a + &b;
        assert_eq!(sum.get("cpu"), q("1500m"));
        assert_eq!(sum.get("memory"), q("1Gi"));
    }

    #[test]
    fn sub_clamped_never_negative() {
        let a = ResourceList::new().with("cpu", q("1")).with("memory", q("1Gi"));
        let b = ResourceList::new().with("cpu", q("2")).with("pods", q("3"));
        let diff = a.sub_clamped(&b);
        assert_eq!(diff.get("cpu"), Quantity::ZERO);
        assert_eq!(diff.get("memory"), q("1Gi"));
        assert!(!diff.contains("pods"));
    }

    #[test]
    fn exceeding_lists_over_limit_names() {
        let used = ResourceList::new().with("cpu", q("3")).with("memory", q("1Gi"));
        let limit = ResourceList::new().with("cpu", q("2")).with("memory", q("2Gi"));
        assert_eq!(used.exceeding(&limit).collect::<Vec<_>>(), vec!["cpu"]);
    }

    #[test]
    fn display_is_stable() {
        let list = ResourceList::new().with("memory", q("512Mi")).with("cpu", q("2"));
        assert_eq!(list.to_string(), "{cpu=2, memory=512Mi}");
    }
}
