//! Resolves hierarchical target allocations into per-symbol percentages.
//!
//! A target group subdivides one node of an allocation tree. Its constraint
//! is a list of category values leading from the root to the node, followed
//! by the metadata column used to split that node's symbols:
//!
//! ```yaml
//! target_asset_alloc:
//!   Classes:
//!     Constraint: [Class]
//!     Equity: 80
//!     Bonds: 20
//!   Regions:
//!     Constraint: [Equity, Region]
//!     Canada: 30
//!     US: 70
//! ```
//!
//! Groups apply in order of constraint length. Leaves split their share
//! evenly between their symbols.

use crate::core::error::TargetError;
use crate::core::snapshot::TargetAllocation;
use rust_decimal::Decimal;
use std::collections::BTreeMap;

/// Per-symbol metadata columns from the positions export.
pub type Metadata = BTreeMap<String, BTreeMap<String, String>>;

/// Allowed drift of a percentage sum away from 100.
const TOLERANCE: Decimal = Decimal::from_parts(1, 0, 0, false, 2);

#[derive(Debug, Clone, PartialEq)]
pub struct TargetGroup {
    pub name: String,
    /// Filter values followed by the grouping column.
    pub constraint: Vec<String>,
    /// Category value and its percentage of the parent node, in file order.
    pub allocations: Vec<(String, Decimal)>,
}

impl TargetGroup {
    pub fn filter_path(&self) -> &[String] {
        match self.constraint.split_last() {
            Some((_, path)) => path,
            None => &[],
        }
    }

    pub fn column(&self) -> &str {
        self.constraint.last().map_or("", String::as_str)
    }
}

/// Flat per-symbol targets plus the groups they came from, ordered as
/// applied.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedTargets {
    pub flat: TargetAllocation,
    pub groups: Vec<TargetGroup>,
}

/// Parses the raw `target_asset_alloc` mapping.
pub fn parse_groups(raw: &serde_yaml::Mapping) -> Result<Vec<TargetGroup>, TargetError> {
    if raw.is_empty() {
        return Err(TargetError::Empty);
    }

    let mut groups = Vec::with_capacity(raw.len());
    for (name, spec) in raw {
        let name = scalar(name);
        let Some(spec) = spec.as_mapping() else {
            return Err(TargetError::MissingConstraint(name));
        };

        let mut constraint = None;
        let mut allocations = Vec::new();
        for (key, value) in spec {
            let key = scalar(key);
            if key == "Constraint" {
                constraint = serde_yaml::from_value::<Vec<String>>(value.clone()).ok();
                continue;
            }
            let pct = serde_yaml::from_value::<Decimal>(value.clone()).map_err(|e| {
                TargetError::InvalidEntry {
                    name: name.clone(),
                    key: key.clone(),
                    reason: e.to_string(),
                }
            })?;
            if pct.is_sign_negative() && !pct.is_zero() {
                return Err(TargetError::InvalidEntry {
                    name,
                    key,
                    reason: "percentage must not be negative".to_string(),
                });
            }
            allocations.push((key, pct));
        }

        let constraint = match constraint {
            Some(c) if !c.is_empty() => c,
            _ => return Err(TargetError::MissingConstraint(name)),
        };
        if allocations.is_empty() {
            return Err(TargetError::NoAllocations(name));
        }
        groups.push(TargetGroup {
            name,
            constraint,
            allocations,
        });
    }
    Ok(groups)
}

fn scalar(value: &serde_yaml::Value) -> String {
    match value {
        serde_yaml::Value::String(s) => s.clone(),
        serde_yaml::Value::Number(n) => n.to_string(),
        serde_yaml::Value::Bool(b) => b.to_string(),
        other => serde_yaml::to_string(other)
            .map(|s| s.trim().to_string())
            .unwrap_or_default(),
    }
}

struct Node {
    symbols: Vec<String>,
    pct: Decimal,
    children: Option<Vec<(String, usize)>>,
}

/// Builds the allocation tree from `groups` and flattens its leaves.
pub fn resolve(mut groups: Vec<TargetGroup>, metadata: &Metadata) -> Result<ResolvedTargets, TargetError> {
    if groups.is_empty() {
        return Err(TargetError::Empty);
    }
    if let Some(group) = groups.iter().find(|g| g.constraint.is_empty()) {
        return Err(TargetError::MissingConstraint(group.name.clone()));
    }
    groups.sort_by_key(|g| g.constraint.len());

    let mut nodes = vec![Node {
        symbols: metadata.keys().cloned().collect(),
        pct: Decimal::ONE_HUNDRED,
        children: None,
    }];

    for group in &groups {
        let sum: Decimal = group.allocations.iter().map(|(_, pct)| *pct).sum();
        if (sum - Decimal::ONE_HUNDRED).abs() > TOLERANCE {
            return Err(TargetError::BadSum {
                name: group.name.clone(),
                sum,
            });
        }

        let parent = find(&nodes, group)?;
        if nodes[parent].children.is_some() {
            return Err(TargetError::AlreadySubdivided {
                name: group.name.clone(),
                path: group.filter_path().to_vec(),
            });
        }

        let column = group.column();
        let mut buckets: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for symbol in &nodes[parent].symbols {
            let value = metadata
                .get(symbol)
                .and_then(|m| m.get(column))
                .cloned()
                .unwrap_or_default();
            buckets.entry(value).or_default().push(symbol.clone());
        }

        for (key, _) in &group.allocations {
            if !buckets.contains_key(key) {
                return Err(TargetError::UnknownCategory {
                    name: group.name.clone(),
                    key: key.clone(),
                    column: column.to_string(),
                });
            }
        }
        if let Some(value) = buckets
            .keys()
            .find(|v| !group.allocations.iter().any(|(k, _)| k == *v))
        {
            return Err(TargetError::UncoveredCategory {
                name: group.name.clone(),
                column: column.to_string(),
                value: value.clone(),
            });
        }

        let parent_pct = nodes[parent].pct;
        let mut children = Vec::with_capacity(group.allocations.len());
        for (key, pct) in &group.allocations {
            nodes.push(Node {
                symbols: buckets.remove(key).unwrap_or_default(),
                pct: parent_pct * *pct / Decimal::ONE_HUNDRED,
                children: None,
            });
            children.push((key.clone(), nodes.len() - 1));
        }
        nodes[parent].children = Some(children);
    }

    let mut flat = TargetAllocation::new();
    collect_leaves(&nodes, 0, &mut flat);

    let total: Decimal = flat.values().copied().sum();
    if (total - Decimal::ONE_HUNDRED).abs() > TOLERANCE {
        return Err(TargetError::BadTotal(total));
    }
    Ok(ResolvedTargets { flat, groups })
}

fn find(nodes: &[Node], group: &TargetGroup) -> Result<usize, TargetError> {
    let mut current = 0;
    for key in group.filter_path() {
        let next = nodes[current]
            .children
            .as_ref()
            .and_then(|children| children.iter().find(|(k, _)| k == key))
            .map(|(_, index)| *index);
        current = next.ok_or_else(|| TargetError::UnknownPath {
            name: group.name.clone(),
            path: group.filter_path().to_vec(),
        })?;
    }
    Ok(current)
}

fn collect_leaves(nodes: &[Node], index: usize, flat: &mut TargetAllocation) {
    let node = &nodes[index];
    match &node.children {
        Some(children) => {
            for (_, child) in children {
                collect_leaves(nodes, *child, flat);
            }
        }
        None if !node.symbols.is_empty() => {
            let share = node.pct / Decimal::from(node.symbols.len());
            for symbol in &node.symbols {
                *flat.entry(symbol.clone()).or_default() += share;
            }
        }
        None => {}
    }
}

/// Symbols whose metadata matches every filter value of `group`. Each
/// filter value is matched against the first column it appears in.
pub fn symbols_in_scope(group: &TargetGroup, metadata: &Metadata) -> Vec<String> {
    let mut value_column: BTreeMap<&str, &str> = BTreeMap::new();
    for columns in metadata.values() {
        for (column, value) in columns {
            if !value.is_empty() {
                value_column.entry(value.as_str()).or_insert(column.as_str());
            }
        }
    }
    let conditions: Vec<(&str, &str)> = group
        .filter_path()
        .iter()
        .filter_map(|v| value_column.get(v.as_str()).map(|c| (*c, v.as_str())))
        .collect();

    metadata
        .iter()
        .filter(|(_, columns)| {
            conditions
                .iter()
                .all(|(column, value)| columns.get(*column).map(String::as_str) == Some(*value))
        })
        .map(|(symbol, _)| symbol.clone())
        .collect()
}
