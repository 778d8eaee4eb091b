//! Periodic AXFR/SOA-based enumeration of hosts matching a pattern, with
//! diff callbacks.

use std::collections::{BTreeMap, BTreeSet};
use std::net::SocketAddr;

use hickory_client::client::{AsyncClient, ClientHandle};
use hickory_client::rr::rdata::tsig::TsigAlgorithm;
use hickory_client::rr::{DNSClass, Name, RData, RecordType};
use hickory_proto::rr::dnssec::tsig::TSigner;
use hickory_proto::rr::Record;
use regex::Regex;
use snafu::{ResultExt, Snafu};
use tokio::net::TcpStream;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to connect to the mDNS backend at {addr}"))]
    Connect {
        addr: SocketAddr,
        source: std::io::Error,
    },
    #[snafu(display("SOA query failed"))]
    SoaQuery {
        source: hickory_proto::error::ProtoError,
    },
    #[snafu(display("AXFR transfer failed"))]
    Axfr {
        source: hickory_proto::error::ProtoError,
    },
}

type Result<T, E = Error> = std::result::Result<T, E>;

/// One registered host-pattern, keyed by its source string since `Regex`
/// itself has no ordering.
struct PatternState {
    pattern: Regex,
    seen: BTreeSet<String>,
}

/// AXFR/SOA-based fleet discovery loop.
pub struct DnsDiscovery {
    domain: Name,
    addr: SocketAddr,
    signer: Option<TSigner>,
    last_serial: Option<u32>,
    patterns: BTreeMap<String, PatternState>,
}

/// A discovery round's result for one registered pattern: hosts newly seen,
/// and hosts no longer seen.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Diff {
    pub added: BTreeSet<String>,
    pub gone: BTreeSet<String>,
}

impl DnsDiscovery {
    pub fn new(domain: Name, addr: SocketAddr, tsig_key: Option<&str>) -> Self {
        let signer = tsig_key.map(|key| {
            TSigner::new(
                base64_decode_key(key),
                TsigAlgorithm::HmacSha256,
                Name::from_ascii("tsig-key").expect("static name is valid"),
                300,
            )
            .expect("TSIG key material from the operator secret is well-formed")
        });

        Self {
            domain,
            addr,
            signer,
            last_serial: None,
            patterns: BTreeMap::new(),
        }
    }

    /// Registers a host-name-pattern to watch: discovery keeps names whose
    /// first label matches it.
    pub fn register(&mut self, pattern: Regex) {
        self.patterns
            .entry(pattern.as_str().to_string())
            .or_insert_with(|| PatternState {
                pattern,
                seen: BTreeSet::new(),
            });
    }

    async fn connect(&self) -> Result<AsyncClient> {
        let stream = TcpStream::connect(self.addr)
            .await
            .context(ConnectSnafu { addr: self.addr })?;
        let (client, bg) = AsyncClient::with_tsigner(stream, self.signer.clone())
            .await
            .context(AxfrSnafu)?;
        tokio::spawn(bg);
        Ok(client)
    }

    async fn remote_soa_serial(&self) -> Result<Option<u32>> {
        let mut client = self.connect().await?;
        let response = client
            .query(self.domain.clone(), DNSClass::IN, RecordType::SOA)
            .await
            .context(SoaQuerySnafu)?;

        for record in response.answers() {
            if let Some(RData::SOA(soa)) = record.data() {
                return Ok(Some(soa.serial()));
            }
        }
        Ok(None)
    }

    async fn axfr(&self) -> Result<Vec<Record>> {
        let mut client = self.connect().await?;
        let response = client
            .query(self.domain.clone(), DNSClass::IN, RecordType::AXFR)
            .await
            .context(AxfrSnafu)?;
        Ok(response.answers().to_vec())
    }

    /// One discovery round. Returns a [`Diff`], keyed by pattern source
    /// string, for every pattern that changed; a failed transfer logs and
    /// leaves state unchanged.
    pub async fn discover(&mut self) -> BTreeMap<String, Diff> {
        let new_serial = match self.remote_soa_serial().await {
            Ok(Some(serial)) => serial,
            Ok(None) => {
                tracing::warn!("could not fetch SOA serial");
                return BTreeMap::new();
            }
            Err(error) => {
                tracing::warn!(%error, "handled an exception retrieving the new SOA serial");
                return BTreeMap::new();
            }
        };

        if self.last_serial == Some(new_serial) {
            tracing::debug!("no change of SOA serial");
            return BTreeMap::new();
        }

        let records = match self.axfr().await {
            Ok(records) => records,
            Err(error) => {
                tracing::warn!(%error, "AXFR transfer failed");
                return BTreeMap::new();
            }
        };

        let mut accumulators: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for record in &records {
            if !matches!(
                record.record_type(),
                RecordType::A | RecordType::AAAA | RecordType::CNAME
            ) {
                continue;
            }
            let Some(first_label) = record.name().iter().next() else {
                continue;
            };
            let first_label = String::from_utf8_lossy(first_label).to_string();
            for (key, state) in &self.patterns {
                if state.pattern.is_match(&first_label) {
                    accumulators
                        .entry(key.clone())
                        .or_default()
                        .insert(record.name().to_string());
                }
            }
        }

        let mut diffs = BTreeMap::new();
        for (key, state) in self.patterns.iter_mut() {
            let accumulated = accumulators.remove(key).unwrap_or_default();
            let added: BTreeSet<String> = accumulated.difference(&state.seen).cloned().collect();
            let gone: BTreeSet<String> = state.seen.difference(&accumulated).cloned().collect();
            if !added.is_empty() || !gone.is_empty() {
                diffs.insert(key.clone(), Diff { added, gone });
            }
            state.seen = accumulated;
        }

        self.last_serial = Some(new_serial);
        diffs
    }
}

fn base64_decode_key(key: &str) -> Vec<u8> {
    use base64::{engine::general_purpose::STANDARD, Engine};
    STANDARD
        .decode(key)
        .unwrap_or_else(|_| key.as_bytes().to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn diff_is_empty_when_nothing_changed() {
        let diff = Diff::default();
        assert!(diff.added.is_empty() && diff.gone.is_empty());
    }

    #[test]
    fn registering_the_same_pattern_twice_keeps_one_entry() {
        let mut discovery = DnsDiscovery::new(
            Name::from_ascii("cc.eu-de-1.cloud.sap.").unwrap(),
            "127.0.0.1:53".parse().unwrap(),
            None,
        );
        let pattern = Regex::new("^vc-.*$").unwrap();
        discovery.register(pattern.clone());
        discovery.register(pattern);
        assert_eq!(discovery.patterns.len(), 1);
    }
}
