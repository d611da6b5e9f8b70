//! Whole ring views, and finger tables derived from them.

use std::collections::{BTreeMap, HashSet};

use tracing::debug;

use crate::{common::PeerRef, Error, Node, Result};

/// Walks `next` links from `start` until they lead back to it.
///
/// Returns every member in ring order, starting with `start`. A standalone `start` is
/// a ring of one.
pub fn network_nodes(node: &Node, start: &PeerRef) -> Result<Vec<PeerRef>> {
    let mut nodes = vec![start.clone()];
    let mut seen = HashSet::from([start.id]);

    let mut current = node.sync(start)?;

    while let Some(next) = current.next.take() {
        if next == *start {
            break;
        }

        if !seen.insert(next.id) || nodes.len() > node.config().max_routing_hops {
            return Err(Error::RoutingLoop { hops: nodes.len() });
        }

        current = node.sync(&next)?;
        nodes.push(next);
    }

    Ok(nodes)
}

/// Rebuilds `target`'s fingers from a full walk of the ring, installs them in its
/// authoritative links and returns them.
pub fn update_fingers(node: &Node, target: &PeerRef) -> Result<Vec<PeerRef>> {
    let mut nodes = network_nodes(node, target)?;
    nodes.sort();

    let fingers = select_fingers(&nodes, target);

    let mut links = node.sync(target)?;
    links.fingers = fingers.clone();
    node.push(&links)?;

    debug!(node = %target, fingers = fingers.len(), "Updated fingers");

    Ok(fingers)
}

/// Fingers of `target` among `sorted`, ring members sorted by Id: the members
/// 1, 2, 4, ... positions away on either side, without wrapping, plus the middle one.
pub fn select_fingers(sorted: &[PeerRef], target: &PeerRef) -> Vec<PeerRef> {
    let Some(position) = sorted.iter().position(|peer| peer == target) else {
        return Vec::new();
    };

    let mut fingers = BTreeMap::new();

    let mut offset = 1;
    while offset < sorted.len() {
        if let Some(after) = sorted.get(position + offset) {
            fingers.insert(after.id, after.clone());
        }
        if let Some(before) = position.checked_sub(offset).and_then(|i| sorted.get(i)) {
            fingers.insert(before.id, before.clone());
        }

        offset *= 2;
    }

    if let Some(middle) = sorted.get(sorted.len() / 2) {
        fingers.insert(middle.id, middle.clone());
    }

    fingers.remove(&target.id);

    fingers.into_values().collect()
}

#[cfg(test)]
mod test {
    use super::*;

    fn ring(size: u16) -> Vec<PeerRef> {
        let mut peers: Vec<PeerRef> = (0..size)
            .map(|port| PeerRef::new("127.0.0.1", 1000 + port))
            .collect();
        peers.sort();
        peers
    }

    #[test]
    fn powers_of_two() {
        let peers = ring(20);
        let target = &peers[5];

        let fingers = select_fingers(&peers, target);

        // Forward 6, 7, 9, 13; backward 4, 3, 1; and the middle, 10.
        let mut expected: Vec<PeerRef> = [6, 7, 9, 13, 4, 3, 1, 10]
            .iter()
            .map(|&i| peers[i].clone())
            .collect();
        expected.sort();

        assert_eq!(fingers, expected);
    }

    #[test]
    fn middle_is_not_self() {
        let peers = ring(3);

        let fingers = select_fingers(&peers, &peers[1]);

        assert_eq!(fingers, vec![peers[0].clone(), peers[2].clone()]);
    }

    #[test]
    fn small_rings() {
        let peers = ring(1);
        assert!(select_fingers(&peers, &peers[0]).is_empty());

        let peers = ring(2);
        assert_eq!(select_fingers(&peers, &peers[0]), vec![peers[1].clone()]);

        assert!(select_fingers(&peers, &PeerRef::new("10.0.0.1", 1)).is_empty());
    }

    #[test]
    fn standalone_network() {
        let node = Node::builder().start().unwrap();

        assert_eq!(network_nodes(&node, node.peer()).unwrap(), vec![node.peer().clone()]);
        assert!(node.update_fingers().unwrap().is_empty());
    }
}
