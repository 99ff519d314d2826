//! Variable maps and environment resolution.

use crate::node::{Node, NodeTree};
use indexmap::IndexMap;
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

static REFERENCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{\{\s*([A-Za-z_][A-Za-z0-9_]*)\s*\}\}").expect("reference pattern is valid")
});

/// Ordered `name -> value` map used for job context, node environments
/// and step outputs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VariableMap(IndexMap<String, String>);

impl VariableMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    /// Overwrite entries with those of `other`, keeping first-seen order.
    pub fn merge<'a, I>(&mut self, other: I)
    where
        I: IntoIterator<Item = (&'a String, &'a String)>,
    {
        for (key, value) in other {
            self.0.insert(key.clone(), value.clone());
        }
    }

    /// Keep only entries whose name starts with one of `prefixes`.
    /// An empty prefix list keeps nothing.
    pub fn filter_prefixes(&self, prefixes: &[String]) -> VariableMap {
        self.0
            .iter()
            .filter(|(key, _)| prefixes.iter().any(|p| key.starts_with(p.as_str())))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub fn iter(&self) -> indexmap::map::Iter<'_, String, String> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Expand `${{ NAME }}` references in every value against this map.
    /// Single pass; unknown names expand to the empty string.
    pub fn interpolate(&self) -> VariableMap {
        self.0
            .iter()
            .map(|(key, value)| (key.clone(), self.expand(value)))
            .collect()
    }

    /// Expand references in an arbitrary string.
    pub fn expand(&self, input: &str) -> String {
        REFERENCE
            .replace_all(input, |caps: &Captures| {
                self.get(&caps[1]).unwrap_or_default().to_string()
            })
            .into_owned()
    }
}

impl FromIterator<(String, String)> for VariableMap {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl<'a> IntoIterator for &'a VariableMap {
    type Item = (&'a String, &'a String);
    type IntoIter = indexmap::map::Iter<'a, String, String>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

impl From<IndexMap<String, String>> for VariableMap {
    fn from(map: IndexMap<String, String>) -> Self {
        Self(map)
    }
}

/// Effective environment for `node`: the job context, overwritten by each
/// ancestor's environment from the root down, overwritten by the node's
/// own environment. References are expanded after merging.
pub fn resolve(tree: &NodeTree, node: &Node, context: &VariableMap) -> VariableMap {
    let mut resolved = context.clone();
    for ancestor in tree.ancestors(node) {
        resolved.merge(&ancestor.environment);
    }
    resolved.merge(&node.environment);
    resolved.interpolate()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::NodePath;
    use pretty_assertions::assert_eq;

    fn vars(pairs: &[(&str, &str)]) -> VariableMap {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_resolve_precedence() {
        let tree = NodeTree::parse(
            r#"
envs:
  X: "1"
steps:
  - name: child
    envs:
      X: "2"
      Y: "3"
    script: env
"#,
        )
        .unwrap();
        let child = tree.get(&NodePath::parse("root/child").unwrap()).unwrap();
        let context = vars(&[("X", "0"), ("Z", "9")]);

        let resolved = resolve(&tree, child, &context);

        assert_eq!(resolved.len(), 3);
        assert_eq!(resolved.get("X"), Some("2"));
        assert_eq!(resolved.get("Y"), Some("3"));
        assert_eq!(resolved.get("Z"), Some("9"));
    }

    #[test]
    fn test_resolve_walks_every_ancestor() {
        let tree = NodeTree::parse(
            r#"
envs:
  A: root
  B: root
steps:
  - name: group
    envs:
      B: group
      C: group
    steps:
      - name: leaf
        envs:
          C: leaf
        script: env
"#,
        )
        .unwrap();
        let leaf = tree.get(&NodePath::parse("root/group/leaf").unwrap()).unwrap();

        let resolved = resolve(&tree, leaf, &VariableMap::new());
        assert_eq!(resolved, vars(&[("A", "root"), ("B", "group"), ("C", "leaf")]));
    }

    #[test]
    fn test_interpolation() {
        let map = vars(&[
            ("REPO", "strata"),
            ("IMAGE", "registry/${{ REPO }}:latest"),
            ("EMPTY", "${{MISSING}}"),
        ]);

        let expanded = map.interpolate();
        assert_eq!(expanded.get("IMAGE"), Some("registry/strata:latest"));
        assert_eq!(expanded.get("EMPTY"), Some(""));
        assert_eq!(map.expand("plain $HOME"), "plain $HOME");
    }

    #[test]
    fn test_filter_prefixes() {
        let map = vars(&[("STRATA_OUT", "1"), ("FLOW_X", "2"), ("PATH", "/bin")]);

        let filtered = map.filter_prefixes(&["STRATA_".to_string(), "FLOW_".to_string()]);
        assert_eq!(filtered, vars(&[("STRATA_OUT", "1"), ("FLOW_X", "2")]));
        assert!(map.filter_prefixes(&[]).is_empty());
    }
}
