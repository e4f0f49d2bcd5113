//! Collective-network transporter. Like the p2p transporters this carries
//! only the control-plane half: capability probing, blob fabrication, and
//! connect-state bookkeeping. The in-network reduction hardware behind it
//! is an external collaborator.

use anyhow::anyhow;
use serde::{Deserialize, Serialize};

use super::channel::{ChannelId, ConnType};
use super::connector::{ConnectHandle, TransportResources, TransporterError};
use crate::comm::PeerInfo;

pub struct CollNetTransporter;

pub static COLLNET_TRANSPORTER: CollNetTransporter = CollNetTransporter;

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct CollNetBlob {
    rank: u64,
    channel: u32,
    direction: u8,
    listen_token: u64,
}

pub(crate) struct CollNetResources {
    pub(crate) collnet_rank: usize,
    pub(crate) num_masters: usize,
}

impl CollNetTransporter {
    /// Capability probe against the virtual root. Only masters probe;
    /// everyone else assumes success.
    pub fn can_connect(&self, my_info: &PeerInfo) -> bool {
        // The offload path requires direct device access to the NIC.
        my_info.gdr_support
    }

    pub fn setup(
        &self,
        channel: ChannelId,
        conn_type: ConnType,
        my_info: &PeerInfo,
    ) -> Result<ConnectHandle, TransporterError> {
        let blob = CollNetBlob {
            rank: my_info.rank,
            channel: channel.0,
            direction: match conn_type {
                ConnType::Send => 0,
                ConnType::Recv => 1,
            },
            listen_token: rand::random(),
        };
        Ok(ConnectHandle::serialize_from(blob)?)
    }

    /// Connect with the consolidated blob list and this master's dense
    /// collnet-local index.
    pub fn connect(
        &self,
        handles: &[ConnectHandle],
        my_index: usize,
    ) -> Result<TransportResources, TransporterError> {
        if my_index >= handles.len() {
            return Err(anyhow!(
                "collnet index {} out of range for {} masters",
                my_index,
                handles.len()
            ));
        }
        for handle in handles {
            let _blob: CollNetBlob = handle.deserialize_to()?;
        }
        Ok(Box::new(CollNetResources {
            collnet_rank: my_index,
            num_masters: handles.len(),
        }))
    }

    pub fn free(&self, resources: TransportResources) -> Result<(), TransporterError> {
        drop(resources);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rendezvous::tests::peer;

    #[test]
    fn connect_validates_index_and_blobs() {
        let mut info = peer(0, 0x1, 1, 0x10, 90);
        info.gdr_support = true;
        assert!(COLLNET_TRANSPORTER.can_connect(&info));

        let h0 = COLLNET_TRANSPORTER
            .setup(ChannelId(0), ConnType::Recv, &info)
            .unwrap();
        let h1 = COLLNET_TRANSPORTER
            .setup(ChannelId(0), ConnType::Recv, &peer(2, 0x2, 1, 0x20, 90))
            .unwrap();
        let handles = vec![h0, h1];
        let resources = COLLNET_TRANSPORTER.connect(&handles, 1).unwrap();
        let res = resources.downcast_ref::<CollNetResources>().unwrap();
        assert_eq!(res.collnet_rank, 1);
        assert_eq!(res.num_masters, 2);

        assert!(COLLNET_TRANSPORTER.connect(&handles, 2).is_err());
    }
}
