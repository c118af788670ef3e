use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use tokio::sync::broadcast;

use super::Args;

/// One mutating command exactly as it was received.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ReplicatedCommand {
    pub offset: u64,
    #[serde(serialize_with = "serialize_args")]
    pub args: Args,
}

/// Bounded backlog of replicated commands plus a live feed.
pub struct ReplicationLog {
    backlog: Mutex<Backlog>,
    capacity: usize,
    live: broadcast::Sender<ReplicatedCommand>,
}

struct Backlog {
    entries: VecDeque<ReplicatedCommand>,
    next_offset: u64,
}

impl ReplicationLog {
    pub fn new(capacity: usize) -> Self {
        let (live, _) = broadcast::channel(capacity.clamp(16, 65_536));
        Self {
            backlog: Mutex::new(Backlog {
                entries: VecDeque::new(),
                next_offset: 1,
            }),
            capacity,
            live,
        }
    }

    pub fn append(&self, args: Args) -> u64 {
        let cmd = {
            let mut backlog = self.backlog.lock();
            let offset = backlog.next_offset;
            backlog.next_offset += 1;
            let cmd = ReplicatedCommand { offset, args };
            if self.capacity > 0 {
                if backlog.entries.len() == self.capacity {
                    backlog.entries.pop_front();
                }
                backlog.entries.push_back(cmd.clone());
            }
            cmd
        };
        let offset = cmd.offset;
        // no subscribers is fine
        let _ = self.live.send(cmd);
        offset
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ReplicatedCommand> {
        self.live.subscribe()
    }

    /// Backlog entries with an offset greater than `offset`.
    pub fn since(&self, offset: u64) -> Vec<ReplicatedCommand> {
        self.backlog
            .lock()
            .entries
            .iter()
            .filter(|c| c.offset > offset)
            .cloned()
            .collect()
    }

    pub fn last_offset(&self) -> u64 {
        self.backlog.lock().next_offset - 1
    }
}

fn serialize_args<S: serde::Serializer>(args: &Args, s: S) -> Result<S::Ok, S::Error> {
    use serde::ser::SerializeSeq;
    let mut seq = s.serialize_seq(Some(args.len()))?;
    for arg in args {
        seq.serialize_element(&super::reply::Reply::Bulk(arg.clone()).to_json())?;
    }
    seq.end()
}
