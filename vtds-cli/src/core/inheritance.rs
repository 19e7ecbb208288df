//! Node class inheritance expansion.
//!
//! Node classes form a tree through their `parent` fields. Expansion
//! merges the ancestor chain from root to leaf over the raw YAML values:
//! child fields override parent fields, mappings merge key by key, and
//! sequences replace rather than concatenate. Entries flagged `delete`
//! are pruned after the merge so a child can drop interfaces, disks or
//! partitions it inherited.

use serde_yaml::Value;
use std::collections::BTreeMap;

use crate::errors::{ConfigError, VtdsResult};

/// Expand the named node class by merging every ancestor in root-to-leaf
/// order. Cycles and unknown parents are configuration errors.
pub fn expand_node_class(
    classes: &BTreeMap<String, Value>,
    name: &str,
) -> VtdsResult<Value> {
    let mut chain = vec![name.to_string()];
    let mut current = name.to_string();
    loop {
        let referent = if chain.len() >= 2 {
            chain[chain.len() - 2].clone()
        } else {
            current.clone()
        };
        let class = classes.get(&current).ok_or_else(|| ConfigError::UnknownParent {
            class: referent,
            parent: current.clone(),
        })?;
        match parent_of(class) {
            None => break,
            Some(parent) => {
                if chain.contains(&parent) {
                    chain.push(parent);
                    return Err(ConfigError::InheritanceCycle {
                        chain: chain.join(" -> "),
                    }
                    .into());
                }
                chain.push(parent.clone());
                current = parent;
            }
        }
    }

    let mut expanded = Value::Mapping(Default::default());
    for ancestor in chain.iter().rev() {
        // Ancestors were all resolved while walking the chain.
        let class = &classes[ancestor];
        merge_into(&mut expanded, class);
    }
    prune_deleted(&mut expanded);
    Ok(expanded)
}

/// Whether a raw node class value is a pure base class, contributing
/// only to inheritance and never materialized.
pub fn is_pure_base_class(class: &Value) -> bool {
    class
        .get("pure_base_class")
        .and_then(Value::as_bool)
        .unwrap_or(false)
}

fn parent_of(class: &Value) -> Option<String> {
    class
        .get("parent")
        .and_then(Value::as_str)
        .map(str::to_string)
}

/// Deep merge `src` over `dst`: mappings merge by key, anything else is
/// replaced by the child value.
fn merge_into(dst: &mut Value, src: &Value) {
    match (dst, src) {
        (Value::Mapping(dst_map), Value::Mapping(src_map)) => {
            for (key, src_value) in src_map {
                match dst_map.get_mut(key) {
                    Some(dst_value) => merge_into(dst_value, src_value),
                    None => {
                        dst_map.insert(key.clone(), src_value.clone());
                    }
                }
            }
        }
        (dst, src) => *dst = src.clone(),
    }
}

fn delete_flag(value: &Value) -> bool {
    value
        .get("delete")
        .and_then(Value::as_bool)
        .unwrap_or(false)
}

fn retain_mapping_entries(value: &mut Value, key: &str, keep: impl Fn(&Value) -> bool) {
    if let Some(Value::Mapping(entries)) = value.get_mut(key) {
        entries.retain(|_, entry| keep(entry));
    }
}

/// Drop network interfaces, additional disks and their partitions that
/// carry the `delete` flag after the merge.
fn prune_deleted(class: &mut Value) {
    retain_mapping_entries(class, "network_interfaces", |entry| !delete_flag(entry));
    if let Some(virtual_machine) = class.get_mut("virtual_machine") {
        retain_mapping_entries(virtual_machine, "additional_disks", |entry| {
            !delete_flag(entry)
        });
        if let Some(Value::Mapping(disks)) = virtual_machine.get_mut("additional_disks") {
            for (_, disk) in disks.iter_mut() {
                retain_mapping_entries(disk, "partitions", |entry| !delete_flag(entry));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classes_from_yaml(yaml: &str) -> BTreeMap<String, Value> {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn test_child_overrides_parent_scalars() {
        let classes = classes_from_yaml(
            r#"
base:
  pure_base_class: true
  node_count: 1
  virtual_machine:
    cpu_count: 2
    memory_size_mib: 2048
child:
  parent: base
  node_count: 3
  virtual_machine:
    cpu_count: 8
"#,
        );
        let expanded = expand_node_class(&classes, "child").unwrap();
        assert_eq!(expanded["node_count"].as_u64(), Some(3));
        assert_eq!(expanded["virtual_machine"]["cpu_count"].as_u64(), Some(8));
        // Mappings merge by key, so the memory setting survives.
        assert_eq!(
            expanded["virtual_machine"]["memory_size_mib"].as_u64(),
            Some(2048)
        );
    }

    #[test]
    fn test_sequences_replace() {
        let classes = classes_from_yaml(
            r#"
base:
  node_naming:
    base_name: node
    node_names: [one, two]
child:
  parent: base
  node_naming:
    node_names: [only]
"#,
        );
        let expanded = expand_node_class(&classes, "child").unwrap();
        let names = expanded["node_naming"]["node_names"].as_sequence().unwrap();
        assert_eq!(names.len(), 1);
        assert_eq!(expanded["node_naming"]["base_name"].as_str(), Some("node"));
    }

    #[test]
    fn test_grandparent_chain_merges_in_order() {
        let classes = classes_from_yaml(
            r#"
root:
  network_interfaces:
    cluster:
      cluster_network: cluster-net
middle:
  parent: root
  node_count: 2
leaf:
  parent: middle
  node_count: 4
"#,
        );
        let expanded = expand_node_class(&classes, "leaf").unwrap();
        assert_eq!(expanded["node_count"].as_u64(), Some(4));
        assert_eq!(
            expanded["network_interfaces"]["cluster"]["cluster_network"].as_str(),
            Some("cluster-net")
        );
    }

    #[test]
    fn test_deleted_entries_pruned() {
        let classes = classes_from_yaml(
            r#"
base:
  network_interfaces:
    cluster:
      cluster_network: cluster-net
    spare:
      cluster_network: spare-net
  virtual_machine:
    additional_disks:
      scratch:
        target_device: vdb
        disk_size_mb: 1024
child:
  parent: base
  network_interfaces:
    spare:
      delete: true
  virtual_machine:
    additional_disks:
      scratch:
        delete: true
"#,
        );
        let expanded = expand_node_class(&classes, "child").unwrap();
        let interfaces = expanded["network_interfaces"].as_mapping().unwrap();
        assert_eq!(interfaces.len(), 1);
        assert!(interfaces.contains_key(&Value::from("cluster")));
        let disks = expanded["virtual_machine"]["additional_disks"]
            .as_mapping()
            .unwrap();
        assert!(disks.is_empty());
    }

    #[test]
    fn test_cycle_detection() {
        let classes = classes_from_yaml(
            r#"
a:
  parent: b
b:
  parent: a
"#,
        );
        let err = expand_node_class(&classes, "a").unwrap_err();
        assert!(err.to_string().contains("cycle"));
    }

    #[test]
    fn test_unknown_parent() {
        let classes = classes_from_yaml(
            r#"
a:
  parent: ghost
"#,
        );
        assert!(expand_node_class(&classes, "a").is_err());
    }
}
