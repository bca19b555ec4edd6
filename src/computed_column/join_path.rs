//! Join graphs of models and join-path comparison.
//!
//! Two aliases in different models are "the same position" when their join
//! paths from the root fact table are isomorphic: the same chain of table
//! identities connected by the same join keys. Alias names play no part.
//!
//! ```text
//!   TEST_KYLIN_FACT ──SELLER_ID=ACCOUNT_ID──▶ TEST_ACCOUNT ──ACCOUNT_COUNTRY=COUNTRY──▶ TEST_COUNTRY
//!        (root)                             (SELLER_ACCOUNT)                          (SELLER_COUNTRY)
//! ```

use crate::model::{split_column_ref, JoinType, Model};
use petgraph::algo::is_isomorphic_matching;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use petgraph::Direction;
use std::collections::HashMap;

/// Table identity of an alias.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinNode {
    pub alias: String,
    pub table: String,
}

/// Join condition between a parent alias and the joined alias, stripped of
/// alias names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinEdge {
    pub join_type: JoinType,
    /// `(foreign column, primary column)` pairs, sorted.
    pub keys: Vec<(String, String)>,
}

impl JoinEdge {
    fn render(&self) -> String {
        let keys: Vec<String> = self
            .keys
            .iter()
            .map(|(fk, pk)| format!("{}={}", fk, pk))
            .collect();
        format!("{:?}:{}", self.join_type, keys.join(","))
    }
}

/// A chain from the root fact table to one alias.
pub type PathGraph = DiGraph<String, JoinEdge>;

#[derive(Debug, Clone)]
pub struct JoinGraph {
    graph: DiGraph<JoinNode, JoinEdge>,
    alias_index: HashMap<String, NodeIndex>,
    root: NodeIndex,
}

impl JoinGraph {
    /// Build the graph of `model`. Joins whose parent alias is unknown are
    /// left unconnected; [`JoinGraph::check_tree`] reports them.
    pub fn from_model(model: &Model) -> Self {
        let mut graph = DiGraph::new();
        let mut alias_index = HashMap::new();
        for (alias, table) in model.aliases() {
            let node = graph.add_node(JoinNode {
                alias: alias.to_uppercase(),
                table: table.to_uppercase(),
            });
            alias_index.insert(alias.to_uppercase(), node);
        }
        let root = alias_index[&model.root_alias().to_uppercase()];

        for join in &model.join_tables {
            let Some(parent) = join
                .parent_alias()
                .and_then(|a| alias_index.get(&a.to_uppercase()).copied())
            else {
                continue;
            };
            let child = alias_index[&join.alias.to_uppercase()];
            let mut keys: Vec<(String, String)> = join
                .join
                .foreign_key
                .iter()
                .zip(join.join.primary_key.iter())
                .map(|(fk, pk)| (column_part(fk), column_part(pk)))
                .collect();
            keys.sort();
            graph.add_edge(
                parent,
                child,
                JoinEdge {
                    join_type: join.join.join_type,
                    keys,
                },
            );
        }
        Self {
            graph,
            alias_index,
            root,
        }
    }

    /// Every alias is reachable from the root through exactly one parent.
    pub fn check_tree(&self) -> Result<(), String> {
        for (alias, &node) in &self.alias_index {
            if node == self.root {
                if self.graph.edges_directed(node, Direction::Incoming).count() > 0 {
                    return Err(format!("root alias {} cannot be joined", alias));
                }
                continue;
            }
            match self.graph.edges_directed(node, Direction::Incoming).count() {
                0 => return Err(format!("alias {} is not joined to the model", alias)),
                1 => {}
                _ => return Err(format!("alias {} is joined more than once", alias)),
            }
            if self.path_nodes(alias).is_none() {
                return Err(format!("alias {} is not reachable from the root", alias));
            }
        }
        Ok(())
    }

    /// Nodes from the root to `alias`, inclusive.
    fn path_nodes(&self, alias: &str) -> Option<Vec<NodeIndex>> {
        let mut node = *self.alias_index.get(&alias.to_uppercase())?;
        let mut path = vec![node];
        while node != self.root {
            let parent = self
                .graph
                .edges_directed(node, Direction::Incoming)
                .next()?
                .source();
            if path.contains(&parent) {
                return None;
            }
            path.push(parent);
            node = parent;
        }
        path.reverse();
        Some(path)
    }

    /// The join chain from the root to `alias` as a standalone graph.
    pub fn path_graph(&self, alias: &str) -> Option<PathGraph> {
        let nodes = self.path_nodes(alias)?;
        let mut path = PathGraph::new();
        let mut previous: Option<(NodeIndex, NodeIndex)> = None;
        for node in nodes {
            let copy = path.add_node(self.graph[node].table.clone());
            if let Some((previous_original, previous_copy)) = previous {
                let edge = self.graph.find_edge(previous_original, node)?;
                path.add_edge(previous_copy, copy, self.graph[edge].clone());
            }
            previous = Some((node, copy));
        }
        Some(path)
    }

    /// Alias-free rendering of the path to `alias`; equal signatures mean
    /// isomorphic paths.
    pub fn signature(&self, alias: &str) -> Option<String> {
        let nodes = self.path_nodes(alias)?;
        let mut signature = self.graph[nodes[0]].table.clone();
        for pair in nodes.windows(2) {
            let edge = self.graph.find_edge(pair[0], pair[1])?;
            signature.push_str(&format!(
                ">[{}]{}",
                self.graph[edge].render(),
                self.graph[pair[1]].table
            ));
        }
        Some(signature)
    }

    /// First alias of this graph whose root path is isomorphic to `target`.
    pub fn find_isomorphic_alias(&self, target: &PathGraph) -> Option<String> {
        let mut aliases: Vec<&String> = self.alias_index.keys().collect();
        aliases.sort();
        aliases.into_iter().find_map(|alias| {
            let candidate = self.path_graph(alias)?;
            is_isomorphic_matching(&candidate, target, |a, b| a == b, |a, b| a == b)
                .then(|| alias.clone())
        })
    }
}

fn column_part(column_ref: &str) -> String {
    split_column_ref(column_ref)
        .map(|(_, column)| column)
        .unwrap_or(column_ref)
        .to_uppercase()
}
