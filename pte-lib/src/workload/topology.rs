use serde::{Deserialize, Serialize};

use super::ConfigError;

/// Orgs, their peers and the ordering service as known to the driver.
///
/// The first peer listed for an org is its anchor peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NetworkTopology {
    pub orgs: Vec<OrgTopology>,
    /// Orderer endpoints, in failover order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub orderers: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OrgTopology {
    pub name: String,
    pub peers: Vec<String>,
    /// Orderer the org's workers broadcast to, the first orderer when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub orderer: Option<String>,
}

impl NetworkTopology {
    pub fn org(&self, name: &str) -> Option<&OrgTopology> {
        self.orgs.iter().find(|org| org.name == name)
    }

    pub fn contains_peer(&self, peer: &str) -> bool {
        self.orgs
            .iter()
            .any(|org| org.peers.iter().any(|p| p == peer))
    }

    pub fn total_peers(&self) -> usize {
        self.orgs.iter().map(|org| org.peers.len()).sum()
    }

    pub fn all_peers(&self) -> Vec<String> {
        self.orgs
            .iter()
            .flat_map(|org| org.peers.iter().cloned())
            .collect()
    }

    /// Orderer a worker of `org` starts broadcasting to.
    ///
    /// `None` leaves the choice to the ledger client.
    pub fn orderer_for(&self, org: &str) -> Option<&str> {
        self.org(org)
            .and_then(|org| org.orderer.as_deref())
            .or_else(|| self.orderers.first().map(String::as_str))
    }

    fn org_or_err(&self, name: &str) -> Result<&OrgTopology, ConfigError> {
        self.org(name)
            .ok_or_else(|| ConfigError::UnknownOrg(name.to_owned()))
    }

    fn anchor(&self, name: &str) -> Result<&str, ConfigError> {
        self.org_or_err(name)?
            .peers
            .first()
            .map(String::as_str)
            .ok_or_else(|| ConfigError::InvalidValue {
                field: "topology.orgs.peers",
                reason: format!("org '{name}' has no peers"),
            })
    }

    /// Peers a transaction is sent to for the given strategy.
    ///
    /// An empty list means the ledger client picks (service discovery).
    pub fn target_peers(
        &self,
        strategy: &TargetPeers,
        channel_orgs: &[String],
    ) -> Result<Vec<String>, ConfigError> {
        let peers = match strategy {
            TargetPeers::OrgAnchor => channel_orgs
                .iter()
                .map(|org| self.anchor(org).map(str::to_owned))
                .collect::<Result<_, _>>()?,
            TargetPeers::AllAnchors => self
                .orgs
                .iter()
                .map(|org| self.anchor(&org.name).map(str::to_owned))
                .collect::<Result<_, _>>()?,
            TargetPeers::OrgPeers => {
                let mut peers = Vec::new();
                for org in channel_orgs {
                    peers.extend(self.org_or_err(org)?.peers.iter().cloned());
                }
                peers
            }
            TargetPeers::AllPeers => self.all_peers(),
            TargetPeers::List(list) => {
                if let Some(unknown) = list.iter().find(|peer| !self.contains_peer(peer)) {
                    return Err(ConfigError::UnknownPeer(unknown.clone()));
                }
                list.clone()
            }
            TargetPeers::Discovery => Vec::new(),
        };
        Ok(peers)
    }

    /// Expected number of responses per query for the given strategy.
    ///
    /// This is computed from the topology at setup time. A peer going down
    /// mid-run makes the observed count fall short and the run fail.
    pub fn fanout_factor(&self, strategy: &TargetPeers, channel_orgs: &[String]) -> usize {
        match strategy {
            TargetPeers::OrgAnchor => channel_orgs.len(),
            TargetPeers::AllAnchors => self.orgs.len(),
            TargetPeers::OrgPeers => channel_orgs
                .iter()
                .filter_map(|org| self.org(org))
                .map(|org| org.peers.len())
                .sum(),
            TargetPeers::AllPeers => self.total_peers(),
            TargetPeers::List(list) => list.len(),
            TargetPeers::Discovery => 1,
        }
    }
}

/// Which peers endorse or answer a worker's transactions.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetPeers {
    /// The anchor peer of every channel org.
    #[default]
    OrgAnchor,
    /// The anchor peer of every org in the topology.
    AllAnchors,
    /// Every peer of the channel orgs.
    OrgPeers,
    /// Every peer in the topology.
    AllPeers,
    /// An explicit list of peer names.
    List(Vec<String>),
    /// Let the ledger client discover endorsers.
    Discovery,
}

impl TargetPeers {
    pub fn name(&self) -> &'static str {
        match self {
            TargetPeers::OrgAnchor => "ORGANCHOR",
            TargetPeers::AllAnchors => "ALLANCHORS",
            TargetPeers::OrgPeers => "ORGPEERS",
            TargetPeers::AllPeers => "ALLPEERS",
            TargetPeers::List(_) => "LIST",
            TargetPeers::Discovery => "DISCOVERY",
        }
    }
}
