//! Candidate attribute parsing and selected-pair correlation.
//!
//! When the transport reports a new selected candidate pair, the controller
//! checks it against the transport's stats before announcing the call as
//! connected. Candidates are parsed into their fields and compared on
//! address and port with the stats entries of a succeeded pair.

use std::collections::HashMap;
use std::net::IpAddr;
use std::str::FromStr;

use log::debug;
use thiserror::Error;

use crate::states::CandidatePairState;
use crate::types::{CandidateType, ConnectionInfo, IceCandidate};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CandidateParseError {
    #[error("missing `candidate:` prefix")]
    MissingPrefix,
    #[error("missing field: {0}")]
    MissingField(&'static str),
    #[error("invalid {field}: {value}")]
    InvalidField { field: &'static str, value: String },
}

/// Fields of an `a=candidate` attribute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateAttribute {
    pub foundation: String,
    pub component: u16,
    pub transport: String,
    pub priority: u32,
    pub address: String,
    pub port: u16,
    pub candidate_type: CandidateType,
    pub related_address: Option<String>,
    pub related_port: Option<u16>,
}

impl FromStr for CandidateAttribute {
    type Err = CandidateParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let s = s.strip_prefix("a=").unwrap_or(s);
        let body = s
            .strip_prefix("candidate:")
            .ok_or(CandidateParseError::MissingPrefix)?;
        let mut parts = body.split_ascii_whitespace();

        let mut next = |field: &'static str| {
            parts
                .next()
                .ok_or(CandidateParseError::MissingField(field))
        };
        let foundation = next("foundation")?.to_string();
        let component = parse_num(next("component")?, "component")?;
        let transport = next("transport")?.to_ascii_lowercase();
        let priority = parse_num(next("priority")?, "priority")?;
        let address = next("address")?.to_string();
        let port = parse_num(next("port")?, "port")?;
        let typ = next("typ")?;
        if typ != "typ" {
            return Err(CandidateParseError::InvalidField {
                field: "typ",
                value: typ.to_string(),
            });
        }
        let type_text = next("type")?;
        let candidate_type =
            CandidateType::parse(type_text).ok_or_else(|| CandidateParseError::InvalidField {
                field: "type",
                value: type_text.to_string(),
            })?;

        let mut related_address = None;
        let mut related_port = None;
        while let Some(key) = parts.next() {
            let Some(value) = parts.next() else { break };
            match key {
                "raddr" => related_address = Some(value.to_string()),
                "rport" => related_port = Some(parse_num(value, "rport")?),
                _ => {}
            }
        }

        Ok(Self {
            foundation,
            component,
            transport,
            priority,
            address,
            port,
            candidate_type,
            related_address,
            related_port,
        })
    }
}

fn parse_num<T: FromStr>(value: &str, field: &'static str) -> Result<T, CandidateParseError> {
    value.parse().map_err(|_| CandidateParseError::InvalidField {
        field,
        value: value.to_string(),
    })
}

/// One candidate entry from transport stats.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CandidateStats {
    pub id: String,
    pub address: Option<String>,
    pub port: Option<u16>,
    pub candidate_type: Option<CandidateType>,
    pub protocol: Option<String>,
    pub relay_protocol: Option<String>,
}

impl CandidateStats {
    fn matches(&self, candidate: &IceCandidate) -> bool {
        let (Some(address), Some(port)) = (self.address.as_deref(), self.port) else {
            return false;
        };
        match candidate.candidate.parse::<CandidateAttribute>() {
            Ok(attr) => attr.port == port && same_address(&attr.address, address),
            // Unparseable attribute text: fall back to looking for the
            // "<address> <port>" pair in it. Approximate, may false-positive
            // when the same text appears as a related address.
            Err(e) => {
                debug!("Matching candidate by text ({e}): {}", candidate.candidate);
                candidate.candidate.contains(&format!("{address} {port}"))
            }
        }
    }

    fn enrich(&self, candidate: &IceCandidate) -> IceCandidate {
        let mut enriched = candidate.clone();
        enriched.candidate_type = self.candidate_type;
        enriched.protocol.clone_from(&self.protocol);
        enriched.relay_protocol.clone_from(&self.relay_protocol);
        enriched
    }
}

fn same_address(a: &str, b: &str) -> bool {
    match (a.parse::<IpAddr>(), b.parse::<IpAddr>()) {
        (Ok(a), Ok(b)) => a == b,
        _ => a.eq_ignore_ascii_case(b),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidatePairStats {
    pub id: String,
    pub local_candidate_id: String,
    pub remote_candidate_id: String,
    pub state: CandidatePairState,
    pub nominated: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TransportStats {
    pub candidate_pairs: Vec<CandidatePairStats>,
    pub candidates: HashMap<String, CandidateStats>,
}

impl TransportStats {
    pub fn add_candidate(&mut self, stats: CandidateStats) {
        self.candidates.insert(stats.id.clone(), stats);
    }
}

/// Matches the reported selected pair against a succeeded pair in `stats`.
///
/// Returns the two candidates enriched with type and protocol information,
/// or `None` when no succeeded pair corresponds to them.
pub fn correlate_selected_pair(
    stats: &TransportStats,
    local: &IceCandidate,
    remote: &IceCandidate,
) -> Option<ConnectionInfo> {
    stats
        .candidate_pairs
        .iter()
        .filter(|pair| pair.state == CandidatePairState::Succeeded)
        .find_map(|pair| {
            let local_stats = stats.candidates.get(&pair.local_candidate_id)?;
            let remote_stats = stats.candidates.get(&pair.remote_candidate_id)?;
            (local_stats.matches(local) && remote_stats.matches(remote)).then(|| {
                ConnectionInfo {
                    local_candidate: local_stats.enrich(local),
                    remote_candidate: remote_stats.enrich(remote),
                }
            })
        })
}
