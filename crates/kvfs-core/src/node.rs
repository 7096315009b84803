// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! In-memory node model and its persisted form

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::error::FsResult;
use crate::types::{Attributes, DirEntry, NodeId, NodeKind};

/// One file or directory held in the tree arena
#[derive(Clone, Debug)]
pub struct Node {
    pub id: NodeId,
    /// Name within the parent directory
    pub name: String,
    /// Back-pointer used for path reconstruction only; `None` for the root
    pub parent: Option<NodeId>,
    pub attrs: Attributes,
    pub xattrs: HashMap<String, Vec<u8>>,
    pub data: NodeData,
    /// In-memory state differs from the persisted record
    pub dirty: bool,
}

#[derive(Clone, Debug)]
pub enum NodeData {
    File {
        content: Vec<u8>,
    },
    Directory {
        /// Materialised children, owned through the arena
        children: HashMap<String, NodeId>,
        /// Every live name, materialised or not
        entries: HashMap<String, DirEntry>,
    },
}

impl Node {
    pub fn new_file(
        id: NodeId,
        name: &str,
        perm: u32,
        parent: Option<NodeId>,
        uid: u32,
        gid: u32,
    ) -> Self {
        Self {
            id,
            name: name.to_string(),
            parent,
            attrs: Attributes::new(id, NodeKind::File, perm, uid, gid),
            xattrs: HashMap::new(),
            data: NodeData::File {
                content: Vec::new(),
            },
            dirty: true,
        }
    }

    pub fn new_dir(
        id: NodeId,
        name: &str,
        perm: u32,
        parent: Option<NodeId>,
        uid: u32,
        gid: u32,
    ) -> Self {
        Self {
            id,
            name: name.to_string(),
            parent,
            attrs: Attributes::new(id, NodeKind::Directory, perm, uid, gid),
            xattrs: HashMap::new(),
            data: NodeData::Directory {
                children: HashMap::new(),
                entries: HashMap::new(),
            },
            dirty: true,
        }
    }

    /// Node with default permissions, used when the store has no usable record
    pub fn synthesize(
        id: NodeId,
        name: &str,
        kind: NodeKind,
        parent: Option<NodeId>,
        uid: u32,
        gid: u32,
    ) -> Self {
        match kind {
            NodeKind::File => Self::new_file(id, name, kind.default_perm(), parent, uid, gid),
            NodeKind::Directory => Self::new_dir(id, name, kind.default_perm(), parent, uid, gid),
        }
    }

    pub fn kind(&self) -> NodeKind {
        match self.data {
            NodeData::File { .. } => NodeKind::File,
            NodeData::Directory { .. } => NodeKind::Directory,
        }
    }

    pub fn is_dir(&self) -> bool {
        matches!(self.data, NodeData::Directory { .. })
    }

    pub fn entry(&self) -> DirEntry {
        DirEntry {
            ino: self.id,
            name: self.name.clone(),
            kind: self.kind(),
        }
    }
}

/// Serialised form of a [`Node`], one per store key
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub id: NodeId,
    pub name: String,
    pub kind: NodeKind,
    pub attrs: Attributes,
    #[serde(default, with = "hex_map")]
    pub xattrs: BTreeMap<String, Vec<u8>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub entries: Vec<DirEntry>,
    #[serde(default, with = "hex_bytes", skip_serializing_if = "Vec::is_empty")]
    pub content: Vec<u8>,
}

impl NodeRecord {
    pub fn from_node(node: &Node) -> Self {
        let (entries, content) = match &node.data {
            NodeData::File { content } => (Vec::new(), content.clone()),
            NodeData::Directory { entries, .. } => {
                let mut entries: Vec<DirEntry> = entries.values().cloned().collect();
                entries.sort_by(|a, b| a.name.cmp(&b.name));
                (entries, Vec::new())
            }
        };
        Self {
            id: node.id,
            name: node.name.clone(),
            kind: node.kind(),
            attrs: node.attrs.clone(),
            xattrs: node.xattrs.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
            entries,
            content,
        }
    }

    /// Rebuild a clean node. Children start unmaterialised; the entries index says what exists.
    pub fn into_node(self, parent: Option<NodeId>) -> Node {
        let data = match self.kind {
            NodeKind::File => NodeData::File {
                content: self.content,
            },
            NodeKind::Directory => NodeData::Directory {
                children: HashMap::new(),
                entries: self.entries.into_iter().map(|e| (e.name.clone(), e)).collect(),
            },
        };
        let mut attrs = self.attrs;
        attrs.ino = self.id;
        attrs.kind = self.kind;
        Node {
            id: self.id,
            name: self.name,
            parent,
            attrs,
            xattrs: self.xattrs.into_iter().collect(),
            data,
            dirty: false,
        }
    }

    pub fn encode(&self) -> FsResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> FsResult<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Aggregate counters and the identifier high-water mark
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FsInfo {
    pub last_id: u64,
    pub files: u64,
    pub directories: u64,
    pub bytes: u64,
}

impl FsInfo {
    pub fn encode(&self) -> FsResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> FsResult<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Canonical key of `name` inside the directory stored at `parent`
pub fn child_key(parent: &str, name: &str) -> String {
    if parent.ends_with('/') {
        format!("{parent}{name}")
    } else {
        format!("{parent}/{name}")
    }
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(s).map_err(serde::de::Error::custom)
    }
}

mod hex_map {
    use std::collections::BTreeMap;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(
        map: &BTreeMap<String, Vec<u8>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        let encoded: BTreeMap<&str, String> =
            map.iter().map(|(k, v)| (k.as_str(), hex::encode(v))).collect();
        encoded.serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<BTreeMap<String, Vec<u8>>, D::Error> {
        let encoded = BTreeMap::<String, String>::deserialize(deserializer)?;
        encoded
            .into_iter()
            .map(|(k, v)| hex::decode(v).map(|bytes| (k, bytes)).map_err(serde::de::Error::custom))
            .collect()
    }
}
