//! Client connection-id lifecycle (RFC 9000 Section 5.1).
//!
//! The server tracks every CID the client has issued, the active one
//! (highest sequence number), and the retirement horizon. Entry 0 is the
//! handshake SCID and carries no stateless reset token.

use bytes::Bytes;

use crate::error::{Error, Result};
use crate::frames::{Frame, NewConnectionIdFrame, RetireConnectionIdFrame};
use crate::types::SR_TOKEN_LEN;

#[derive(Debug, Clone)]
pub struct ClientCid {
    pub seqnum: u64,
    pub id: Bytes,
    pub sr_token: [u8; SR_TOKEN_LEN],
}

#[derive(Debug, Default)]
pub struct ClientCids {
    entries: Vec<ClientCid>,

    /// Sequence number of the CID we currently address the client with.
    pub curr_seqnum: u64,

    /// Largest Retire Prior To seen; smaller values have no effect.
    pub max_retired_seqnum: u64,
}

impl ClientCids {
    /// Seed with the client's handshake source CID as sequence 0.
    pub fn new(initial_scid: Bytes) -> Self {
        Self {
            entries: vec![ClientCid {
                seqnum: 0,
                id: initial_scid,
                sr_token: [0; SR_TOKEN_LEN],
            }],
            curr_seqnum: 0,
            max_retired_seqnum: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains_id(&self, id: &[u8]) -> bool {
        self.entries.iter().any(|cid| cid.id == id)
    }

    /// Iterate entries carrying a stateless reset token (sequence 0 has
    /// none).
    pub fn reset_tokens(&self) -> impl Iterator<Item = &[u8; SR_TOKEN_LEN]> {
        self.entries
            .iter()
            .filter(|cid| cid.seqnum != 0)
            .map(|cid| &cid.sr_token)
    }

    /// Process NEW_CONNECTION_ID (RFC 9000 Section 19.15).
    ///
    /// RETIRE_CONNECTION_ID frames the handling produces are appended to
    /// `out`. Returns the newly preferred CID when the active one
    /// changed. `active_limit` is our `active_connection_id_limit`.
    pub fn handle_new_cid(
        &mut self,
        f: &NewConnectionIdFrame,
        active_limit: u64,
        out: &mut Vec<Frame>,
    ) -> Result<Option<Bytes>> {
        let mut preferred = None;

        if f.seqnum < self.max_retired_seqnum {
            // already told to retire everything below the horizon; the
            // new id goes straight back
            out.push(Frame::RetireConnectionId(RetireConnectionIdFrame {
                seqnum: f.seqnum,
            }));
        } else if let Some(known) = self.entries.iter().find(|cid| cid.seqnum == f.seqnum) {
            // retransmitted frame must repeat itself exactly
            if known.id != f.cid || known.sr_token != f.sr_token {
                return Err(Error::ProtocolViolation);
            }
        } else {
            self.entries.push(ClientCid {
                seqnum: f.seqnum,
                id: f.cid.clone(),
                sr_token: f.sr_token,
            });

            // always address the client with its latest id
            if f.seqnum > self.curr_seqnum {
                self.curr_seqnum = f.seqnum;
                preferred = Some(f.cid.clone());
            }
        }

        // Retire Prior To only ever advances
        if self.max_retired_seqnum == 0 || f.retire_prior_to > self.max_retired_seqnum {
            self.max_retired_seqnum = f.retire_prior_to;

            let retire = f.retire_prior_to;
            self.entries.retain(|cid| {
                if cid.seqnum >= retire {
                    return true;
                }
                out.push(Frame::RetireConnectionId(RetireConnectionIdFrame {
                    seqnum: cid.seqnum,
                }));
                false
            });
        }

        if self.entries.len() as u64 > active_limit {
            return Err(Error::ConnectionIdLimitError);
        }

        Ok(preferred)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(seqnum: u64, retire: u64, id: &'static [u8], token: u8) -> NewConnectionIdFrame {
        NewConnectionIdFrame {
            seqnum,
            retire_prior_to: retire,
            cid: Bytes::from_static(id),
            sr_token: [token; SR_TOKEN_LEN],
        }
    }

    #[test]
    fn test_new_cid_becomes_preferred() {
        let mut cids = ClientCids::new(Bytes::from_static(&[0; 8]));
        let mut out = Vec::new();

        let preferred = cids
            .handle_new_cid(&frame(1, 0, &[1; 8], 0xaa), 4, &mut out)
            .unwrap();

        assert_eq!(preferred.as_deref(), Some(&[1u8; 8][..]));
        assert_eq!(cids.curr_seqnum, 1);
        assert_eq!(cids.len(), 2);
        assert!(out.is_empty());
    }

    #[test]
    fn test_duplicate_must_match() {
        let mut cids = ClientCids::new(Bytes::from_static(&[0; 8]));
        let mut out = Vec::new();

        cids.handle_new_cid(&frame(1, 0, &[1; 8], 0xaa), 4, &mut out)
            .unwrap();
        // identical retransmission is fine
        cids.handle_new_cid(&frame(1, 0, &[1; 8], 0xaa), 4, &mut out)
            .unwrap();
        // same seq with different id is a protocol violation
        assert!(matches!(
            cids.handle_new_cid(&frame(1, 0, &[2; 8], 0xaa), 4, &mut out),
            Err(Error::ProtocolViolation)
        ));
        assert!(matches!(
            cids.handle_new_cid(&frame(1, 0, &[1; 8], 0xbb), 4, &mut out),
            Err(Error::ProtocolViolation)
        ));
    }

    #[test]
    fn test_retire_prior_to() {
        let mut cids = ClientCids::new(Bytes::from_static(&[0; 8]));
        let mut out = Vec::new();

        cids.handle_new_cid(&frame(1, 0, &[1; 8], 1), 8, &mut out).unwrap();
        cids.handle_new_cid(&frame(2, 0, &[2; 8], 2), 8, &mut out).unwrap();
        assert!(out.is_empty());

        // retire everything below 2
        cids.handle_new_cid(&frame(3, 2, &[3; 8], 3), 8, &mut out).unwrap();

        let retired: Vec<u64> = out
            .iter()
            .map(|f| match f {
                Frame::RetireConnectionId(r) => r.seqnum,
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        assert_eq!(retired, vec![0, 1]);
        assert_eq!(cids.len(), 2); // seq 2 and 3 remain
    }

    #[test]
    fn test_below_horizon_retired_immediately() {
        let mut cids = ClientCids::new(Bytes::from_static(&[0; 8]));
        let mut out = Vec::new();

        cids.handle_new_cid(&frame(5, 4, &[5; 8], 5), 8, &mut out).unwrap();
        out.clear();

        // seq 2 is below the horizon of 4
        cids.handle_new_cid(&frame(2, 0, &[2; 8], 2), 8, &mut out).unwrap();
        assert!(matches!(
            out.as_slice(),
            [Frame::RetireConnectionId(RetireConnectionIdFrame { seqnum: 2 })]
        ));
        // and was not stored
        assert!(!cids.contains_id(&[2; 8]));
    }

    #[test]
    fn test_active_limit_enforced() {
        let mut cids = ClientCids::new(Bytes::from_static(&[0; 8]));
        let mut out = Vec::new();

        cids.handle_new_cid(&frame(1, 0, &[1; 8], 1), 2, &mut out).unwrap();
        assert!(matches!(
            cids.handle_new_cid(&frame(2, 0, &[2; 8], 2), 2, &mut out),
            Err(Error::ConnectionIdLimitError)
        ));
    }

    #[test]
    fn test_reset_tokens_skip_initial() {
        let mut cids = ClientCids::new(Bytes::from_static(&[0; 8]));
        let mut out = Vec::new();
        cids.handle_new_cid(&frame(1, 0, &[1; 8], 0x11), 4, &mut out).unwrap();

        let tokens: Vec<_> = cids.reset_tokens().collect();
        assert_eq!(tokens, vec![&[0x11; SR_TOKEN_LEN]]);
    }
}
