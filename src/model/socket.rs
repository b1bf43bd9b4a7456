//! Sockets and the socket-type algebra.
//!
//! A socket type is a comma-separated list of tags (`"str,int"`). Two
//! sockets are compatible when their tag sets intersect or either side
//! declares `any`.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use smallvec::SmallVec;

use crate::node::NodeId;
use crate::{Error, Result};

pub const ANY: &str = "any";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketType {
    tags: SmallVec<[String; 2]>,
}

impl SocketType {
    pub fn any() -> Self {
        Self::parse(ANY)
    }

    pub fn parse(declared: &str) -> Self {
        let mut tags: SmallVec<[String; 2]> = declared
            .split(',')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .collect();
        if tags.is_empty() {
            tags.push(ANY.to_string());
        }
        Self { tags }
    }

    pub fn tags(&self) -> &[String] {
        &self.tags
    }

    pub fn is_any(&self) -> bool {
        self.tags.iter().any(|t| t == ANY)
    }

    /// Whether an edge from a socket of this type into `other` is allowed.
    pub fn accepts(&self, other: &SocketType) -> bool {
        self.is_any() || other.is_any() || self.tags.iter().any(|t| other.tags.contains(t))
    }
}

impl Default for SocketType {
    fn default() -> Self {
        Self::any()
    }
}

impl fmt::Display for SocketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.tags.join(","))
    }
}

impl From<&str> for SocketType {
    fn from(s: &str) -> Self {
        Self::parse(s)
    }
}

impl Serialize for SocketType {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for SocketType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(Self::parse(&s))
    }
}

/// Static declaration of an input or output port.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Socket {
    pub name: String,
    #[serde(rename = "socket_type")]
    pub socket_type: SocketType,
    #[serde(default)]
    pub optional: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
}

impl Socket {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), socket_type: SocketType::any(), optional: false, group: None }
    }

    pub fn typed(mut self, socket_type: &str) -> Self {
        self.socket_type = SocketType::parse(socket_type);
        self
    }

    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    pub fn group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }
}

/// Address of a socket inside a graph, rendered as `<node>.<socket>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SocketRef {
    pub node: NodeId,
    pub socket: String,
}

impl SocketRef {
    pub fn new(node: &NodeId, socket: &str) -> Self {
        Self { node: node.clone(), socket: socket.to_string() }
    }
}

impl fmt::Display for SocketRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.node, self.socket)
    }
}

impl FromStr for SocketRef {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.split_once('.') {
            Some((node, socket)) if !node.is_empty() && !socket.is_empty() => {
                Ok(Self { node: NodeId::from(node), socket: socket.to_string() })
            }
            _ => Err(Error::Graph(format!("malformed socket reference: {s:?}"))),
        }
    }
}

impl Serialize for SocketRef {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for SocketRef {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_matching() {
        let s = SocketType::parse("str,int");
        assert!(s.accepts(&SocketType::parse("int")));
        assert!(!s.accepts(&SocketType::parse("bool")));
        assert!(s.accepts(&SocketType::any()));
        assert!(SocketType::any().accepts(&SocketType::parse("dict")));
        assert_eq!(SocketType::parse("").to_string(), "any");
        assert_eq!(SocketType::parse(" str , int ").to_string(), "str,int");
    }

    #[test]
    fn test_socket_ref_parse() {
        let r: SocketRef = "abc-1.value".parse().unwrap();
        assert_eq!(r.node, NodeId::from("abc-1"));
        assert_eq!(r.socket, "value");
        assert_eq!(r.to_string(), "abc-1.value");
        assert!("novalue".parse::<SocketRef>().is_err());
        assert!(".x".parse::<SocketRef>().is_err());
    }
}
