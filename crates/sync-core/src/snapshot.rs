//! Snapshot builder: flattens either side into a key to item map.

use crate::model::{Item, ItemMap};
use crate::orchestrator::TreeEvent;
use crate::tree::TreeNode;

/// Title a node's children are attributed to.
///
/// Permanent roots answer with their canonical title, everything else with
/// its own title.
pub fn attributed_title(node: &TreeNode) -> &str {
    match node.role {
        Some(role) => role.canonical_title(),
        None => &node.title,
    }
}

/// The item a tree node stands for.
pub fn item_for_node(node: &TreeNode, parent_title: Option<&str>) -> Item {
    Item::new(
        node.title.clone(),
        node.url.clone(),
        parent_title.map(str::to_string),
        node.date_added,
        node.date_modified.unwrap_or(node.date_added),
    )
}

/// Flatten the local tree.
///
/// Permanent roots are not items themselves; their children carry the
/// root's canonical title as parent title. When two nodes share a key the
/// first one in depth-first order wins.
pub fn build_local(roots: &[TreeNode]) -> ItemMap {
    let mut map = ItemMap::new();
    for root in roots {
        match root.role {
            Some(role) => {
                for child in &root.children {
                    visit(child, Some(role.canonical_title()), &mut map);
                }
            }
            None => visit(root, None, &mut map),
        }
    }
    map
}

fn visit(node: &TreeNode, parent_title: Option<&str>, map: &mut ItemMap) {
    let item = item_for_node(node, parent_title);
    map.entry(item.key.clone()).or_insert(item);

    if node.is_container() {
        for child in &node.children {
            visit(child, Some(&node.title), map);
        }
    }
}

/// Project the remote document's entries into a map, verbatim.
pub fn build_remote(items: &[Item]) -> ItemMap {
    let mut map = ItemMap::new();
    for item in items {
        map.entry(item.key.clone()).or_insert_with(|| item.clone());
    }
    map
}

/// Tree notifications that turn `before` into `after`.
///
/// Used by hosts that can only observe the whole tree rather than
/// individual mutations. Events come out in key order.
pub fn diff_snapshots(before: &ItemMap, after: &ItemMap) -> Vec<TreeEvent> {
    let mut events = Vec::new();

    let mut removed: Vec<&Item> = before
        .iter()
        .filter(|(key, _)| !after.contains_key(*key))
        .map(|(_, item)| item)
        .collect();
    removed.sort_by(|a, b| a.key.cmp(&b.key));
    events.extend(removed.into_iter().cloned().map(TreeEvent::Removed));

    let mut current: Vec<&Item> = after.values().collect();
    current.sort_by(|a, b| a.key.cmp(&b.key));
    for item in current {
        match before.get(&item.key) {
            None => events.push(TreeEvent::Created(item.clone())),
            Some(old) if old.parent_title != item.parent_title => {
                events.push(TreeEvent::Moved(item.clone()))
            }
            Some(old) if old.title != item.title || old.date_modified != item.date_modified => {
                events.push(TreeEvent::Changed(item.clone()))
            }
            Some(_) => {}
        }
    }

    events
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::ItemKey;
    use crate::tree::RootRole;

    fn leaf(id: &str, title: &str, url: &str, added: u64, modified: Option<u64>) -> TreeNode {
        TreeNode {
            id: id.into(),
            parent_id: None,
            title: title.into(),
            url: Some(url.into()),
            date_added: added,
            date_modified: modified,
            role: None,
            children: vec![],
        }
    }

    fn folder(id: &str, title: &str, children: Vec<TreeNode>) -> TreeNode {
        TreeNode {
            id: id.into(),
            parent_id: None,
            title: title.into(),
            url: None,
            date_added: 1,
            date_modified: None,
            role: None,
            children,
        }
    }

    fn root(id: &str, title: &str, role: RootRole, children: Vec<TreeNode>) -> TreeNode {
        TreeNode {
            role: Some(role),
            ..folder(id, title, children)
        }
    }

    #[test]
    fn test_roots_recognized_by_role_not_title() {
        // Localized display titles must not leak into parent titles
        let roots = vec![
            root(
                "1",
                "Barra de favoritos",
                RootRole::Toolbar,
                vec![leaf("3", "X", "http://x.test", 10, None)],
            ),
            root(
                "2",
                "Outros favoritos",
                RootRole::Other,
                vec![folder("4", "Research", vec![])],
            ),
        ];
        let map = build_local(&roots);

        assert_eq!(map.len(), 2);
        let x = &map[&ItemKey::derive(Some("http://x.test"), "X", None)];
        assert_eq!(x.parent_title.as_deref(), Some("Bookmarks Bar"));
        let research = &map[&ItemKey::derive(None, "Research", Some("Other Bookmarks"))];
        assert_eq!(research.parent_title.as_deref(), Some("Other Bookmarks"));
    }

    #[test]
    fn test_nested_parent_titles_and_dates() {
        let roots = vec![root(
            "1",
            "Bar",
            RootRole::Toolbar,
            vec![folder(
                "3",
                "Research",
                vec![
                    leaf("4", "A", "http://a.test", 10, Some(50)),
                    leaf("5", "B", "http://b.test", 20, None),
                ],
            )],
        )];
        let map = build_local(&roots);

        let a = &map[&ItemKey::derive(Some("http://a.test"), "", None)];
        assert_eq!(a.parent_title.as_deref(), Some("Research"));
        assert_eq!(a.date_modified, 50);
        let b = &map[&ItemKey::derive(Some("http://b.test"), "", None)];
        // Falls back to creation time
        assert_eq!(b.date_modified, 20);
        assert!(!b.deleted);
    }

    #[test]
    fn test_duplicate_urls_first_wins() {
        let roots = vec![
            root(
                "1",
                "Bar",
                RootRole::Toolbar,
                vec![leaf("3", "First", "http://x.test", 1, None)],
            ),
            root(
                "2",
                "Other",
                RootRole::Other,
                vec![leaf("4", "Second", "http://x.test/", 2, None)],
            ),
        ];
        let map = build_local(&roots);
        assert_eq!(map.len(), 1);
        assert_eq!(map.values().next().unwrap().title, "First");
    }

    #[test]
    fn test_build_remote_preserves_fields() {
        let mut gone = Item::new("Y", Some("http://y.test".into()), Some("Research".into()), 1, 9);
        gone.deleted = true;
        let map = build_remote(&[gone.clone()]);
        assert_eq!(map[&gone.key], gone);
    }

    #[test]
    fn test_diff_snapshots() {
        let kept = Item::new("K", Some("http://k.test".into()), None, 1, 1);
        let removed = Item::new("R", Some("http://r.test".into()), None, 1, 1);
        let moved = Item::new("M", Some("http://m.test".into()), Some("A".into()), 1, 1);
        let before = build_remote(&[kept.clone(), removed.clone(), moved.clone()]);

        let mut moved_after = moved.clone();
        moved_after.parent_title = Some("B".into());
        let created = Item::new("C", Some("http://c.test".into()), None, 2, 2);
        let after = build_remote(&[kept, moved_after.clone(), created.clone()]);

        let events = diff_snapshots(&before, &after);
        assert_eq!(events.len(), 3);
        assert!(events.contains(&TreeEvent::Removed(removed)));
        assert!(events.contains(&TreeEvent::Moved(moved_after)));
        assert!(events.contains(&TreeEvent::Created(created)));

        assert!(diff_snapshots(&after, &after).is_empty());
    }
}
