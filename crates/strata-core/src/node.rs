//! Pipeline tree types.
//!
//! A pipeline YAML document is parsed into a [`NodeTree`]: an arena of
//! [`Node`]s laid out in pre-order (parent, then children in declaration
//! order, then the next sibling). Because the arena order *is* the
//! execution order, `next`/`previous` are index lookups.

use crate::{Error, Result};
use indexmap::IndexMap;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::fmt;

/// Name given to the root node when the document does not declare one.
pub const DEFAULT_ROOT_NAME: &str = "root";

const PATH_SEPARATOR: char = '/';

/// Slash-delimited, unique location of a node within its tree.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct NodePath(String);

impl NodePath {
    /// Parse a full path such as `root/build/test`.
    pub fn parse(path: &str) -> Result<Self> {
        if path.is_empty() {
            return Err(Error::Parse("empty node path".to_string()));
        }
        for segment in path.split(PATH_SEPARATOR) {
            validate_name(segment)?;
        }
        Ok(Self(path.to_string()))
    }

    pub fn root(name: &str) -> Result<Self> {
        validate_name(name)?;
        Ok(Self(name.to_string()))
    }

    /// Path of a direct child. The name must already be validated.
    fn child(&self, name: &str) -> Self {
        Self(format!("{}{}{}", self.0, PATH_SEPARATOR, name))
    }

    pub fn parent(&self) -> Option<NodePath> {
        self.0
            .rsplit_once(PATH_SEPARATOR)
            .map(|(parent, _)| NodePath(parent.to_string()))
    }

    /// The last segment.
    pub fn name(&self) -> &str {
        self.0
            .rsplit_once(PATH_SEPARATOR)
            .map_or(self.0.as_str(), |(_, name)| name)
    }

    pub fn depth(&self) -> usize {
        self.0.matches(PATH_SEPARATOR).count()
    }

    pub fn is_ancestor_of(&self, other: &NodePath) -> bool {
        other.0.len() > self.0.len()
            && other.0.starts_with(&self.0)
            && other.0[self.0.len()..].starts_with(PATH_SEPARATOR)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<String> for NodePath {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        NodePath::parse(&value)
    }
}

impl From<NodePath> for String {
    fn from(path: NodePath) -> Self {
        path.0
    }
}

fn validate_name(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let valid = chars.next().is_some_and(|c| c.is_ascii_alphanumeric())
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));

    if valid {
        Ok(())
    } else {
        Err(Error::Parse(format!("invalid node name '{}'", name)))
    }
}

/// Validate a plugin reference of the form `name[@version]`, where the
/// name may be namespaced (`strata/checkout@v1`).
fn validate_plugin_ref(reference: &str) -> Result<()> {
    let is_token = |s: &str| {
        !s.is_empty()
            && s
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
    };

    let (name, version) = match reference.split_once('@') {
        Some((name, version)) => (name, Some(version)),
        None => (reference, None),
    };

    let valid = name.split('/').all(is_token) && version.is_none_or(is_token);
    if valid {
        Ok(())
    } else {
        Err(Error::Parse(format!("invalid plugin reference '{}'", reference)))
    }
}

/// Branch and tag patterns deciding whether a node applies to a trigger.
/// Stored for consumers; not evaluated by the scheduler.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filter {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub branches: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

impl Filter {
    pub fn is_empty(&self) -> bool {
        self.branches.is_empty() && self.tags.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SelectorYml {
    #[serde(default, alias = "label")]
    pub tags: Vec<String>,
}

/// One step as written in pipeline YAML. The document root uses the same
/// shape.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepYml {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(
        default,
        alias = "environment",
        deserialize_with = "scalar_map",
        skip_serializing_if = "IndexMap::is_empty"
    )]
    pub envs: IndexMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<SelectorYml>,
    #[serde(default, alias = "trigger", skip_serializing_if = "Option::is_none")]
    pub filter: Option<Filter>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub script: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plugin: Option<String>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub allow_failure: bool,
    #[serde(default, rename = "final", skip_serializing_if = "is_false")]
    pub is_final: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub steps: Vec<StepYml>,
}

fn is_false(value: &bool) -> bool {
    !*value
}

/// Environment values may be written as any YAML scalar; they are kept as
/// strings.
fn scalar_map<'de, D>(deserializer: D) -> std::result::Result<IndexMap<String, String>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<IndexMap<String, serde_yaml::Value>>::deserialize(deserializer)?;

    raw.unwrap_or_default()
        .into_iter()
        .map(|(key, value)| {
            let value = match value {
                serde_yaml::Value::String(s) => s,
                serde_yaml::Value::Number(n) => n.to_string(),
                serde_yaml::Value::Bool(b) => b.to_string(),
                serde_yaml::Value::Null => String::new(),
                _ => {
                    return Err(D::Error::custom(format!(
                        "variable '{}' must be a scalar",
                        key
                    )));
                }
            };
            Ok((key, value))
        })
        .collect()
}

/// A pipeline step.
#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub path: NodePath,
    pub name: String,
    pub script: Option<String>,
    pub before: Option<String>,
    pub after: Option<String>,
    pub environment: IndexMap<String, String>,
    pub selector: Vec<String>,
    pub filter: Filter,
    pub plugin: Option<String>,
    pub allow_failure: bool,
    pub is_final: bool,
    /// Step timeout in seconds.
    pub timeout: Option<u64>,
    parent: Option<usize>,
    children: Vec<usize>,
    /// One past the arena index of the last descendant.
    subtree_end: usize,
}

impl Node {
    /// Whether the node has anything for an agent to run.
    pub fn is_executable(&self) -> bool {
        [&self.before, &self.script, &self.after, &self.plugin]
            .into_iter()
            .any(|s| s.as_deref().is_some_and(|s| !s.trim().is_empty()))
    }
}

/// Parsed, read-only representation of a full pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeTree {
    nodes: Vec<Node>,
    index: HashMap<NodePath, usize>,
}

impl NodeTree {
    /// Parse a pipeline YAML document.
    pub fn parse(yaml: &str) -> Result<Self> {
        let root: StepYml = serde_yaml::from_str(yaml)?;
        Self::from_yml(&root)
    }

    /// Build a tree from an already-deserialized document.
    pub fn from_yml(root: &StepYml) -> Result<Self> {
        let name = root.name.as_deref().unwrap_or(DEFAULT_ROOT_NAME);
        let path = NodePath::root(name)?;

        let mut tree = NodeTree {
            nodes: Vec::new(),
            index: HashMap::new(),
        };
        tree.add(root, name, path, None)?;
        Ok(tree)
    }

    fn add(
        &mut self,
        yml: &StepYml,
        name: &str,
        path: NodePath,
        parent: Option<usize>,
    ) -> Result<usize> {
        if let Some(plugin) = &yml.plugin {
            validate_plugin_ref(plugin)?;
        }

        let index = self.nodes.len();
        if self.index.insert(path.clone(), index).is_some() {
            return Err(Error::Parse(format!("duplicate node path '{}'", path)));
        }

        self.nodes.push(Node {
            path: path.clone(),
            name: name.to_string(),
            script: yml.script.clone(),
            before: yml.before.clone(),
            after: yml.after.clone(),
            environment: yml.envs.clone(),
            selector: yml.selector.as_ref().map(|s| s.tags.clone()).unwrap_or_default(),
            filter: yml.filter.clone().unwrap_or_default(),
            plugin: yml.plugin.clone(),
            allow_failure: yml.allow_failure,
            is_final: yml.is_final,
            timeout: yml.timeout,
            parent,
            children: Vec::new(),
            subtree_end: index + 1,
        });

        let mut seen = HashSet::new();
        let mut children = Vec::with_capacity(yml.steps.len());

        for (position, step) in yml.steps.iter().enumerate() {
            let child_name = step
                .name
                .clone()
                .unwrap_or_else(|| format!("step-{}", position + 1));
            validate_name(&child_name)?;

            if !seen.insert(child_name.clone()) {
                return Err(Error::Parse(format!(
                    "step name '{}' is used twice under '{}'",
                    child_name, path
                )));
            }

            let child_path = path.child(&child_name);
            children.push(self.add(step, &child_name, child_path, Some(index))?);
        }

        let end = self.nodes.len();
        let node = &mut self.nodes[index];
        node.children = children;
        node.subtree_end = end;
        Ok(index)
    }

    /// Reconstruct YAML for this tree. Every node name is written out
    /// explicitly so positional defaults survive a round trip.
    pub fn serialize(&self) -> Result<String> {
        let yml = self.to_yml(self.root());
        serde_yaml::to_string(&yml).map_err(|e| Error::Serialization(e.to_string()))
    }

    fn to_yml(&self, node: &Node) -> StepYml {
        StepYml {
            name: Some(node.name.clone()),
            envs: node.environment.clone(),
            selector: (!node.selector.is_empty()).then(|| SelectorYml {
                tags: node.selector.clone(),
            }),
            filter: (!node.filter.is_empty()).then(|| node.filter.clone()),
            before: node.before.clone(),
            script: node.script.clone(),
            after: node.after.clone(),
            plugin: node.plugin.clone(),
            allow_failure: node.allow_failure,
            is_final: node.is_final,
            timeout: node.timeout,
            steps: self.children(node).map(|c| self.to_yml(c)).collect(),
        }
    }

    pub fn root(&self) -> &Node {
        // A tree always holds at least its root.
        &self.nodes[0]
    }

    pub fn get(&self, path: &NodePath) -> Option<&Node> {
        self.index.get(path).map(|&i| &self.nodes[i])
    }

    pub fn parent(&self, node: &Node) -> Option<&Node> {
        node.parent.map(|i| &self.nodes[i])
    }

    pub fn children<'a>(&'a self, node: &'a Node) -> impl Iterator<Item = &'a Node> + 'a {
        node.children.iter().map(|&i| &self.nodes[i])
    }

    /// Ancestors of `node`, from the root down to its immediate parent.
    pub fn ancestors(&self, node: &Node) -> Vec<&Node> {
        let mut chain = Vec::new();
        let mut current = node.parent;
        while let Some(i) = current {
            chain.push(&self.nodes[i]);
            current = self.nodes[i].parent;
        }
        chain.reverse();
        chain
    }

    /// All nodes strictly below `path`, in traversal order.
    pub fn subtree(&self, path: &NodePath) -> &[Node] {
        match self.index.get(path) {
            Some(&i) => &self.nodes[i + 1..self.nodes[i].subtree_end],
            None => &[],
        }
    }

    pub fn next(&self, path: &NodePath) -> Option<&NodePath> {
        let &i = self.index.get(path)?;
        self.nodes.get(i + 1).map(|n| &n.path)
    }

    pub fn previous(&self, path: &NodePath) -> Option<&NodePath> {
        let &i = self.index.get(path)?;
        let prev = i.checked_sub(1)?;
        Some(&self.nodes[prev].path)
    }

    /// Position of `path` in traversal order.
    pub fn position(&self, path: &NodePath) -> Option<usize> {
        self.index.get(path).copied()
    }

    /// Nodes in traversal order.
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter()
    }

    /// Paths in traversal order.
    pub fn order(&self) -> impl Iterator<Item = &NodePath> {
        self.nodes.iter().map(|n| &n.path)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Agent tags required to run this pipeline.
    pub fn required_tags(&self) -> &[String] {
        &self.root().selector
    }
}

/// Hex sha256 of a YAML document, the cache key under which parsed trees
/// are shared between jobs.
pub fn content_hash(yaml: &str) -> String {
    Sha256::digest(yaml.as_bytes())
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}
