//! # transport
//!
//! why: the driver must not care how requests reach other members
//! relations: server.rs binds one endpoint per server and sends everything node.rs queues
//! what: Transport trait, Incoming, LocalTransport (in-process, with partitions)

use crate::error::{RaftError, Result};
use crate::message::{Request, Response};
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::RwLock;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

/// A request delivered to a bound member, with the channel to answer it on.
#[derive(Debug)]
pub struct Incoming {
    pub from: u64,
    pub request: Request,
    reply: oneshot::Sender<Result<Response>>,
}

impl Incoming {
    pub fn new(from: u64, request: Request) -> (Self, oneshot::Receiver<Result<Response>>) {
        let (reply, receiver) = oneshot::channel();
        (Self { from, request, reply }, receiver)
    }

    /// Answers the sender. A sender that stopped waiting is ignored.
    pub fn respond(self, response: Result<Response>) {
        let _ = self.reply.send(response);
    }

    pub fn into_parts(self) -> (u64, Request, oneshot::Sender<Result<Response>>) {
        (self.from, self.request, self.reply)
    }
}

/// Moves requests between members.
pub trait Transport: Send + Sync + 'static {
    /// Starts receiving requests addressed to `member`.
    fn bind(&self, member: u64) -> Result<mpsc::UnboundedReceiver<Incoming>>;

    /// Sends `request` and resolves with the response.
    fn send(&self, from: u64, to: u64, request: Request) -> BoxFuture<'static, Result<Response>>;

    /// Stops receiving for `member`.
    fn unbind(&self, _member: u64) {}
}

#[derive(Debug, Default)]
struct Network {
    endpoints: HashMap<u64, mpsc::UnboundedSender<Incoming>>,
    /// unordered pairs that cannot reach each other
    cut: BTreeSet<(u64, u64)>,
}

fn link(a: u64, b: u64) -> (u64, u64) {
    (a.min(b), a.max(b))
}

/// In-process transport. Every clone shares one network, so tests can cut
/// and heal links while servers run.
#[derive(Debug, Clone, Default)]
pub struct LocalTransport {
    network: Arc<RwLock<Network>>,
}

impl LocalTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cuts the link between `a` and `b` in both directions.
    pub fn partition(&self, a: u64, b: u64) {
        tracing::debug!(a, b, "partitioning link");
        self.network.write().cut.insert(link(a, b));
    }

    /// Cuts `member` off from every bound member.
    pub fn isolate(&self, member: u64) {
        let mut network = self.network.write();
        let others: Vec<u64> = network.endpoints.keys().copied().filter(|&id| id != member).collect();
        for other in others {
            network.cut.insert(link(member, other));
        }
        tracing::debug!(member, "isolated member");
    }

    /// Restores every link.
    pub fn heal(&self) {
        self.network.write().cut.clear();
    }

    pub fn is_bound(&self, member: u64) -> bool {
        self.network.read().endpoints.contains_key(&member)
    }

    fn route(&self, from: u64, to: u64) -> Result<mpsc::UnboundedSender<Incoming>> {
        let network = self.network.read();
        if network.cut.contains(&link(from, to)) {
            return Err(RaftError::NetworkFailure {
                member: to,
                reason: "link is partitioned".into(),
            });
        }
        network.endpoints.get(&to).cloned().ok_or_else(|| RaftError::NetworkFailure {
            member: to,
            reason: "member is not bound".into(),
        })
    }
}

impl Transport for LocalTransport {
    fn bind(&self, member: u64) -> Result<mpsc::UnboundedReceiver<Incoming>> {
        let mut network = self.network.write();
        if network.endpoints.get(&member).is_some_and(|sender| !sender.is_closed()) {
            return Err(RaftError::IllegalMemberState(format!("member {member} is already bound")));
        }
        let (sender, receiver) = mpsc::unbounded_channel();
        network.endpoints.insert(member, sender);
        Ok(receiver)
    }

    fn send(&self, from: u64, to: u64, request: Request) -> BoxFuture<'static, Result<Response>> {
        let route = self.route(from, to);
        let network = Arc::clone(&self.network);
        async move {
            let endpoint = route?;
            let (incoming, response) = Incoming::new(from, request);
            endpoint.send(incoming).map_err(|_| RaftError::NetworkFailure {
                member: to,
                reason: "member stopped".into(),
            })?;
            let response = response.await.map_err(|_| RaftError::NetworkFailure {
                member: to,
                reason: "request dropped".into(),
            })?;
            // a link cut while the request was in flight loses the response
            if network.read().cut.contains(&link(from, to)) {
                return Err(RaftError::NetworkFailure {
                    member: to,
                    reason: "link is partitioned".into(),
                });
            }
            response
        }
        .boxed()
    }

    fn unbind(&self, member: u64) {
        self.network.write().endpoints.remove(&member);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{VoteRequest, VoteResponse};

    fn vote() -> Request {
        Request::Vote(VoteRequest {
            term: 1,
            candidate: 1,
            last_log_index: 0,
            last_log_term: 0,
        })
    }

    fn answer(mut receiver: mpsc::UnboundedReceiver<Incoming>) {
        tokio::spawn(async move {
            while let Some(incoming) = receiver.recv().await {
                incoming.respond(Ok(Response::Vote(VoteResponse { term: 1, granted: true })));
            }
        });
    }

    #[tokio::test]
    async fn delivers_and_returns_response() {
        let transport = LocalTransport::new();
        answer(transport.bind(2).unwrap());

        let response = transport.send(1, 2, vote()).await.unwrap();

        assert_eq!(response, Response::Vote(VoteResponse { term: 1, granted: true }));
    }

    #[tokio::test]
    async fn unbound_member_is_a_network_failure() {
        let transport = LocalTransport::new();
        let error = transport.send(1, 9, vote()).await.unwrap_err();
        assert!(matches!(error, RaftError::NetworkFailure { member: 9, .. }));
    }

    #[tokio::test]
    async fn partition_cuts_both_directions_until_healed() {
        let transport = LocalTransport::new();
        answer(transport.bind(1).unwrap());
        answer(transport.bind(2).unwrap());

        transport.partition(1, 2);
        assert!(transport.send(1, 2, vote()).await.is_err());
        assert!(transport.send(2, 1, vote()).await.is_err());

        transport.heal();
        assert!(transport.send(2, 1, vote()).await.is_ok());
    }

    #[tokio::test]
    async fn isolate_cuts_every_link() {
        let transport = LocalTransport::new();
        for id in 1..=3 {
            answer(transport.bind(id).unwrap());
        }

        transport.isolate(3);

        assert!(transport.send(1, 3, vote()).await.is_err());
        assert!(transport.send(3, 2, vote()).await.is_err());
        assert!(transport.send(1, 2, vote()).await.is_ok());
    }

    #[tokio::test]
    async fn binding_twice_is_rejected_until_unbound() {
        let transport = LocalTransport::new();
        let _receiver = transport.bind(1).unwrap();
        assert!(transport.bind(1).is_err());

        transport.unbind(1);
        assert!(!transport.is_bound(1));
        assert!(transport.bind(1).is_ok());
    }
}
