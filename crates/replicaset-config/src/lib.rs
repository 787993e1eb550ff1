//! Replica-set configuration documents: the model, and the two ways we
//! produce one.
//!
//! A [`ReplicaSetConfig`] is either built fresh (first initiation, §4.4) or
//! derived by mutating the live document returned by `replSetGetConfig`
//! (§4.3, §4.5). The mutation path deliberately works on the raw
//! [`bson::Document`] rather than round-tripping through our own model, so
//! that fields we don't model, such as `term`, `settings`, and
//! `protocolVersion`, pass through untouched. Mutation never touches
//! `setName` or `term`.

use std::collections::BTreeSet;
use std::net::Ipv4Addr;

use bson::{doc, Bson, Document};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("replica-set config document missing field '{0}'")]
    MissingField(&'static str),

    #[error("replica-set config field '{0}' had unexpected type")]
    WrongType(&'static str),

    #[error("member host '{0}' is not in 'ip:port' form")]
    InvalidHost(String),
}

/// A single member of a replica-set configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberSpec {
    pub member_id: u32,
    /// `ip:port`, matching the wire format MongoDB expects.
    pub host: String,
}

impl MemberSpec {
    pub fn new(member_id: u32, ip: Ipv4Addr, port: u16) -> Self {
        Self {
            member_id,
            host: format!("{ip}:{port}"),
        }
    }

    pub fn ip(&self) -> Result<Ipv4Addr, ConfigError> {
        self.host
            .split(':')
            .next()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| ConfigError::InvalidHost(self.host.clone()))
    }
}

/// A replica-set configuration document, as MongoDB understands one.
///
/// `set_name` is fixed for the life of the system; `version` strictly
/// increases on every successful reconfiguration; member ids are unique and
/// never reused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicaSetConfig {
    pub set_name: String,
    pub version: u32,
    pub members: Vec<MemberSpec>,
}

impl ReplicaSetConfig {
    /// The set of member IPs, for comparison against the orchestrator's task set.
    pub fn member_ips(&self) -> Result<BTreeSet<Ipv4Addr>, ConfigError> {
        self.members.iter().map(MemberSpec::ip).collect()
    }
}

/// Build a fresh configuration for first-time initiation.
///
/// Members get sequential ids `0..n-1` in the order `ips` is given; version
/// starts at 1.
pub fn fresh_config(set_name: &str, ips: &[Ipv4Addr], port: u16) -> ReplicaSetConfig {
    let members = ips
        .iter()
        .enumerate()
        .map(|(i, ip)| MemberSpec::new(i as u32, *ip, port))
        .collect();
    ReplicaSetConfig {
        set_name: set_name.to_string(),
        version: 1,
        members,
    }
}

/// Render a [`ReplicaSetConfig`] as the document `rs.initiate`/`replSetInitiate` expects.
pub fn to_document(config: &ReplicaSetConfig) -> Document {
    let members: Vec<Bson> = config
        .members
        .iter()
        .map(|m| Bson::Document(doc! { "_id": m.member_id as i32, "host": &m.host }))
        .collect();
    doc! {
        "_id": &config.set_name,
        "version": config.version as i32,
        "members": members,
    }
}

/// The next member id to assign: `max(existing) + 1`, or 0 if there are none.
///
/// Ids are never reused within the lifetime of the set, so this must be
/// computed from the ids present in the document being mutated, not from a
/// running counter.
pub fn next_member_id(existing: &[u32]) -> u32 {
    existing.iter().max().map_or(0, |m| m + 1)
}

/// Parse a raw `replSetGetConfig` response document into our model.
pub fn parse_config(doc: &Document) -> Result<ReplicaSetConfig, ConfigError> {
    let set_name = doc
        .get_str("_id")
        .map_err(|_| ConfigError::MissingField("_id"))?
        .to_string();
    let version = doc
        .get_i32("version")
        .map(|v| v as u32)
        .map_err(|_| ConfigError::MissingField("version"))?;
    let members_bson = doc
        .get_array("members")
        .map_err(|_| ConfigError::MissingField("members"))?;

    let mut members = Vec::with_capacity(members_bson.len());
    for m in members_bson {
        let m = m.as_document().ok_or(ConfigError::WrongType("members[]"))?;
        let member_id = m
            .get_i32("_id")
            .map(|v| v as u32)
            .map_err(|_| ConfigError::MissingField("members[]._id"))?;
        let host = m
            .get_str("host")
            .map_err(|_| ConfigError::MissingField("members[].host"))?
            .to_string();
        members.push(MemberSpec { member_id, host });
    }

    Ok(ReplicaSetConfig {
        set_name,
        version,
        members,
    })
}

/// Mutate a live configuration document to reflect `to_remove`/`to_add`.
///
/// Drops any member whose host-ip is in `to_remove`, appends a new member
/// for each ip in `to_add` with sequential ids starting from
/// `next_member_id`, and bumps `version`. Every other field of `existing`
/// (notably `term` and `settings`) is carried over unmodified; we never
/// reconstruct the document from scratch once a set exists.
pub fn mutate_document(
    existing: &Document,
    to_remove: &BTreeSet<Ipv4Addr>,
    to_add: &BTreeSet<Ipv4Addr>,
    port: u16,
) -> Result<Document, ConfigError> {
    let mut doc = existing.clone();

    let members_bson = doc
        .get_array("members")
        .map_err(|_| ConfigError::MissingField("members"))?
        .clone();

    let mut kept = Vec::with_capacity(members_bson.len());
    let mut kept_ids = Vec::with_capacity(members_bson.len());
    for m in members_bson {
        let member = m.as_document().ok_or(ConfigError::WrongType("members[]"))?;
        let host = member
            .get_str("host")
            .map_err(|_| ConfigError::MissingField("members[].host"))?;
        let ip: Ipv4Addr = host
            .split(':')
            .next()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| ConfigError::InvalidHost(host.to_string()))?;
        if to_remove.contains(&ip) {
            continue;
        }
        let member_id = member
            .get_i32("_id")
            .map_err(|_| ConfigError::MissingField("members[]._id"))?;
        kept_ids.push(member_id as u32);
        kept.push(Bson::Document(member.clone()));
    }

    let mut next_id = next_member_id(&kept_ids);
    for ip in to_add {
        kept.push(Bson::Document(doc! {
            "_id": next_id as i32,
            "host": format!("{ip}:{port}"),
        }));
        next_id += 1;
    }

    let new_version = doc
        .get_i32("version")
        .map_err(|_| ConfigError::MissingField("version"))?
        + 1;

    doc.insert("members", kept);
    doc.insert("version", new_version);
    Ok(doc)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> Ipv4Addr {
        s.parse().unwrap()
    }

    #[test]
    fn fresh_config_assigns_sequential_ids() {
        let ips = vec![ip("10.0.0.5"), ip("10.0.0.6"), ip("10.0.0.7")];
        let config = fresh_config("rs0", &ips, 27017);
        assert_eq!(config.version, 1);
        assert_eq!(config.members[0].member_id, 0);
        assert_eq!(config.members[0].host, "10.0.0.5:27017");
        assert_eq!(config.members[2].member_id, 2);
    }

    #[test]
    fn next_member_id_is_max_plus_one_or_zero() {
        assert_eq!(next_member_id(&[]), 0);
        assert_eq!(next_member_id(&[0, 1, 2]), 3);
        assert_eq!(next_member_id(&[0, 5, 2]), 6);
    }

    #[test]
    fn mutate_document_preserves_unmodeled_fields() {
        let existing = doc! {
            "_id": "rs0",
            "version": 3,
            "term": 7,
            "protocolVersion": 1,
            "members": [
                { "_id": 0, "host": "10.0.0.5:27017" },
                { "_id": 1, "host": "10.0.0.6:27017" },
            ],
        };
        let to_remove: BTreeSet<Ipv4Addr> = [ip("10.0.0.5")].into_iter().collect();
        let to_add: BTreeSet<Ipv4Addr> = [ip("10.0.0.8")].into_iter().collect();

        let mutated = mutate_document(&existing, &to_remove, &to_add, 27017).unwrap();

        assert_eq!(mutated.get_i32("version").unwrap(), 4);
        assert_eq!(mutated.get_i32("term").unwrap(), 7);
        assert_eq!(mutated.get_i32("protocolVersion").unwrap(), 1);

        let parsed = parse_config(&mutated).unwrap();
        assert_eq!(parsed.members.len(), 2);
        assert!(parsed
            .members
            .iter()
            .any(|m| m.host == "10.0.0.6:27017" && m.member_id == 1));
        assert!(parsed
            .members
            .iter()
            .any(|m| m.host == "10.0.0.8:27017" && m.member_id == 2));
    }

    #[test]
    fn mutate_document_never_reuses_member_ids() {
        let existing = doc! {
            "_id": "rs0",
            "version": 1,
            "members": [
                { "_id": 0, "host": "10.0.0.5:27017" },
                { "_id": 1, "host": "10.0.0.6:27017" },
            ],
        };
        // Remove member 0, then add a replacement ip in the same step.
        let to_remove: BTreeSet<Ipv4Addr> = [ip("10.0.0.5")].into_iter().collect();
        let to_add: BTreeSet<Ipv4Addr> = [ip("10.0.1.5")].into_iter().collect();
        let mutated = mutate_document(&existing, &to_remove, &to_add, 27017).unwrap();
        let parsed = parse_config(&mutated).unwrap();
        let new_member = parsed
            .members
            .iter()
            .find(|m| m.host == "10.0.1.5:27017")
            .unwrap();
        // id 0 was freed but must not be reused; the next id after max(kept) is 2.
        assert_eq!(new_member.member_id, 2);
    }

    #[test]
    fn parse_config_roundtrips_fresh_config() {
        let ips = vec![ip("10.0.0.5"), ip("10.0.0.6")];
        let config = fresh_config("rs0", &ips, 27017);
        let doc = to_document(&config);
        let parsed = parse_config(&doc).unwrap();
        assert_eq!(config, parsed);
    }

    #[test]
    fn member_ips_extracts_all_hosts() {
        let ips = vec![ip("10.0.0.5"), ip("10.0.0.6")];
        let config = fresh_config("rs0", &ips, 27017);
        let extracted = config.member_ips().unwrap();
        assert_eq!(extracted, ips.into_iter().collect());
    }
}
