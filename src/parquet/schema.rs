// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Schema tree reconstruction and logical path resolution.

use super::format::{Repetition, SchemaElement};
use crate::row::{ColumnType, SchemaPath, TableDescriptor};

/// A node of the file schema tree, annotated with the level information
/// the column readers drive on.
#[derive(Clone, Debug)]
pub struct SchemaNode {
    pub element: SchemaElement,

    /// Ordinal among the file's materialized (leaf) columns
    pub col_idx: Option<usize>,

    pub max_def_level: i32,
    pub max_rep_level: i32,

    /// Definition level of the nearest repeated ancestor, not counting
    /// this node itself. Values with a definition level below this belong
    /// to an empty or NULL enclosing collection and produce no output.
    pub ira_def_level: i32,

    pub children: Vec<SchemaNode>,
}

impl SchemaNode {
    #[must_use]
    pub fn is_repeated(&self) -> bool {
        self.element.repetition == Repetition::Repeated
    }
}

/// Reconstructs the schema tree from the footer's flattened depth-first
/// element list.
pub fn create_schema_tree(schema: &[SchemaElement]) -> crate::Result<SchemaNode> {
    let mut idx = 0;
    let mut col_idx = 0;
    let root = build_node(schema, 0, 0, 0, &mut idx, &mut col_idx)?;

    if idx != schema.len() {
        return Err(crate::Error::Corrupt(
            "could not reconstruct schema tree from flattened schema in file metadata".into(),
        ));
    }

    Ok(root)
}

fn build_node(
    schema: &[SchemaElement],
    mut max_def_level: i32,
    mut max_rep_level: i32,
    mut ira_def_level: i32,
    idx: &mut usize,
    col_idx: &mut usize,
) -> crate::Result<SchemaNode> {
    let Some(element) = schema.get(*idx) else {
        return Err(crate::Error::Corrupt(
            "could not reconstruct schema tree from flattened schema in file metadata".into(),
        ));
    };
    *idx += 1;

    let leaf_col_idx = if element.num_children == 0 {
        let this = *col_idx;
        *col_idx += 1;
        Some(this)
    } else {
        None
    };

    // The nearest-repeated-ancestor level excludes this node, so record it
    // before any bump below
    let node_ira = ira_def_level;

    match element.repetition {
        Repetition::Optional => max_def_level += 1,
        Repetition::Repeated => {
            max_rep_level += 1;
            // A repeated field also adds a definition level; it is what
            // distinguishes an empty list from a list with an item
            max_def_level += 1;
            ira_def_level = max_def_level;
        }
        Repetition::Required => {}
    }

    let num_children = element.num_children;
    let element = element.clone();

    let mut children = Vec::with_capacity(num_children);
    for _ in 0..num_children {
        children.push(build_node(
            schema,
            max_def_level,
            max_rep_level,
            ira_def_level,
            idx,
            col_idx,
        )?);
    }

    Ok(SchemaNode {
        element,
        col_idx: leaf_col_idx,
        max_def_level,
        max_rep_level,
        ira_def_level: node_ira,
        children,
    })
}

/// Result of resolving a logical path against the file schema
#[derive(Debug)]
pub struct ResolvedPath<'a> {
    pub node: Option<&'a SchemaNode>,

    /// The path addresses the synthetic array-position field
    pub pos_field: bool,

    /// The path does not exist in this file (schema evolution)
    pub missing_field: bool,
}

fn child_type(col_type: &ColumnType, idx: usize) -> Option<&ColumnType> {
    match col_type {
        ColumnType::Array(item) => (idx == 0).then(|| item.as_ref()),
        ColumnType::Map(key, value) => match idx {
            0 => Some(key.as_ref()),
            1 => Some(value.as_ref()),
            _ => None,
        },
        ColumnType::Struct(fields) => fields.get(idx),
        _ => None,
    }
}

/// Resolves `path` to the corresponding schema node by ordinal.
///
/// The first index is table-level (it counts partition keys); array and
/// map traversal follows the Parquet LIST/MAP conventions, with the one
/// backward-compat branch for lists whose inner group elides the element
/// node.
pub fn resolve_path<'a>(
    root: &'a SchemaNode,
    table: &TableDescriptor,
    path: &SchemaPath,
) -> crate::Result<ResolvedPath<'a>> {
    let missing = || {
        Ok(ResolvedPath {
            node: None,
            pos_field: false,
            missing_field: true,
        })
    };

    let mut node = root;
    let mut col_type: Option<&ColumnType> = None;

    let mut i = 0;
    while i < path.len() {
        let table_idx = *path.get(i).expect("i < path.len()");

        // The first index in a path includes the table's partition keys
        let file_idx = if i == 0 {
            match table_idx.checked_sub(table.num_partition_keys) {
                Some(idx) => idx,
                None => return missing(),
            }
        } else {
            table_idx
        };

        match node.children.get(file_idx) {
            Some(child) => node = child,
            None => {
                log::debug!("file does not contain path {path:?}");
                return missing();
            }
        }

        col_type = Some(if i == 0 {
            match table.columns.get(table_idx) {
                Some(col) => &col.col_type,
                None => return missing(),
            }
        } else {
            let parent = col_type.expect("set on previous iteration");
            match child_type(parent, table_idx) {
                Some(child) => child,
                None => return missing(),
            }
        });

        match col_type.expect("just set") {
            ColumnType::Array(item) => {
                // <list-repetition> group <name> (LIST) {
                //   repeated group list { <element-repetition> <type> element; }
                // }
                if node.children.len() != 1 {
                    return Err(unrecognized("array", node));
                }
                let list = node.children.first().expect("len is 1");
                if !list.is_repeated() || list.children.is_empty() {
                    return Err(unrecognized("array", node));
                }
                node = list;

                if i + 1 < path.len() {
                    if *path.get(i + 1).expect("in bounds") == 1 {
                        // The synthetic position field; it has no node
                        debug_assert_eq!(path.len(), i + 2, "position field has no children");
                        return Ok(ResolvedPath {
                            node: None,
                            pos_field: true,
                            missing_field: false,
                        });
                    }
                    debug_assert_eq!(0, *path.get(i + 1).expect("in bounds"));
                }

                if list.children.len() != 1 {
                    // Legacy layout: the inner element group was elided and
                    // the struct fields hang directly off the repeated
                    // group; skip the item index in the path
                    col_type = Some(item.as_ref());
                    i += 1;
                }
            }

            ColumnType::Map(_, _) => {
                // <map-repetition> group <name> (MAP) {
                //   repeated group key_value { key; value; }
                // }
                if node.children.len() != 1 {
                    return Err(unrecognized("map", node));
                }
                let key_value = node.children.first().expect("len is 1");
                if !key_value.is_repeated() || key_value.children.len() != 2 {
                    return Err(unrecognized("map", node));
                }
                node = key_value;

                if i + 1 < path.len() {
                    debug_assert!(*path.get(i + 1).expect("in bounds") <= 1);
                }
            }

            _ => {}
        }

        i += 1;
    }

    Ok(ResolvedPath {
        node: Some(node),
        pos_field: false,
        missing_field: false,
    })
}

fn unrecognized(kind: &str, node: &SchemaNode) -> crate::Error {
    crate::Error::UnsupportedSchema(format!(
        "unrecognized {kind} schema at element {:?}",
        node.element.name,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parquet::format::PhysicalType;
    use crate::row::ColumnDescriptor;
    use test_log::test;

    fn flat_schema() -> Vec<SchemaElement> {
        vec![
            SchemaElement::group("schema", Repetition::Required, 2),
            SchemaElement::leaf("id", Repetition::Required, PhysicalType::Int32),
            SchemaElement::leaf("name", Repetition::Optional, PhysicalType::ByteArray),
        ]
    }

    fn array_schema() -> Vec<SchemaElement> {
        vec![
            SchemaElement::group("schema", Repetition::Required, 1),
            SchemaElement::group("nums", Repetition::Optional, 1),
            SchemaElement::group("list", Repetition::Repeated, 1),
            SchemaElement::leaf("element", Repetition::Optional, PhysicalType::Int32),
        ]
    }

    #[test]
    fn schema_levels() -> crate::Result<()> {
        let root = create_schema_tree(&flat_schema())?;

        assert_eq!(2, root.children.len());

        let id = root.children.first().expect("two children");
        assert_eq!(Some(0), id.col_idx);
        assert_eq!(0, id.max_def_level);
        assert_eq!(0, id.max_rep_level);

        let name = root.children.get(1).expect("two children");
        assert_eq!(Some(1), name.col_idx);
        assert_eq!(1, name.max_def_level);
        assert_eq!(0, name.max_rep_level);

        Ok(())
    }

    #[test]
    fn schema_nested_levels() -> crate::Result<()> {
        let root = create_schema_tree(&array_schema())?;

        let nums = root.children.first().expect("one child");
        let list = nums.children.first().expect("one child");
        let element = list.children.first().expect("one child");

        assert!(list.is_repeated());
        assert_eq!(2, list.max_def_level);
        assert_eq!(1, list.max_rep_level);
        assert_eq!(0, list.ira_def_level);

        assert_eq!(3, element.max_def_level);
        assert_eq!(1, element.max_rep_level);
        assert_eq!(2, element.ira_def_level);
        assert_eq!(Some(0), element.col_idx);

        Ok(())
    }

    #[test]
    fn schema_truncated_fails() {
        let mut schema = flat_schema();
        schema.pop();
        assert!(matches!(
            create_schema_tree(&schema),
            Err(crate::Error::Corrupt(_))
        ));
    }

    #[test]
    fn schema_resolve_scalar_and_missing() -> crate::Result<()> {
        let root = create_schema_tree(&flat_schema())?;
        let table = TableDescriptor::new(
            vec![
                ColumnDescriptor {
                    name: "id".into(),
                    col_type: ColumnType::Int,
                },
                ColumnDescriptor {
                    name: "name".into(),
                    col_type: ColumnType::String,
                },
                ColumnDescriptor {
                    name: "added_later".into(),
                    col_type: ColumnType::Double,
                },
            ],
            0,
        );

        let resolved = resolve_path(&root, &table, &vec![1])?;
        let node = resolved.node.expect("resolves");
        assert_eq!("name", node.element.name);

        let resolved = resolve_path(&root, &table, &vec![2])?;
        assert!(resolved.missing_field);

        Ok(())
    }

    #[test]
    fn schema_resolve_array_element_and_pos() -> crate::Result<()> {
        let root = create_schema_tree(&array_schema())?;
        let table = TableDescriptor::new(
            vec![ColumnDescriptor {
                name: "nums".into(),
                col_type: ColumnType::Array(Box::new(ColumnType::Int)),
            }],
            0,
        );

        // Item
        let resolved = resolve_path(&root, &table, &vec![0, 0])?;
        let node = resolved.node.expect("resolves");
        assert_eq!("element", node.element.name);

        // Synthetic position field
        let resolved = resolve_path(&root, &table, &vec![0, 1])?;
        assert!(resolved.pos_field);
        assert!(resolved.node.is_none());

        Ok(())
    }
}
