//! # server
//!
//! why: put the io-free node, the executor and the compactor on their own tasks
//! relations: drives node.rs and executor.rs, sends through transport.rs, wakes up through timer.rs
//! what: RaftServer::start, ServerHandle, the raft task and the apply task
//!
//! ```text
//!  ServerHandle ─┐                      ┌─> Transport::send ── Outcome ─┐
//!  Transport ────┼─> raft task (RaftNode) ─┤                              │
//!  Timer ────────┘        ^             └─> apply task (Executor) ───────┤
//!                         └──────────── Tick, Outcome, Suspects ─────────┘
//! ```
//!
//! the raft task is the only owner of RaftNode and the apply task the only
//! owner of the Executor; they talk over unbounded channels. a client request
//! accepted by the leader registers a waiter with the apply task before the
//! entry can be handed over, so no result is ever missed.

use crate::config::ServerConfig;
use crate::error::{RaftError, Result};
use crate::executor::{Applied, Executor, Output, QueryResult};
use crate::message::{
    CommandRequest, ConfigurationResponse, KeepAliveRequest, OperationResponse, PublishRequest, QueryRequest,
    RegisterRequest, RegisterResponse, Request, Response, UnregisterRequest,
};
use crate::node::{Completion, NodeStatus, RaftNode, Reply};
use crate::state_machine::StateMachine;
use crate::timer::Timer;
use crate::transport::{Incoming, Transport};
use raft_storage::{Compactor, CompactorHandle, Entry, Log, Member, Storage};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::Instrument;

/// name of the raft log under the storage directory
const LOG_NAME: &str = "raft";
/// published event batches buffered per subscriber
const EVENT_CAPACITY: usize = 1024;

/// Wall clock in milliseconds. Entry timestamps come from here, so every
/// leader stamps entries on the same scale.
pub fn clock() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or_default()
}

type Responder = oneshot::Sender<Result<Response>>;

enum Input {
    Request(Incoming),
    Outcome {
        to: u64,
        request: Request,
        result: Result<Response>,
    },
    Tick,
    Suspects(Vec<u64>),
    Leave(oneshot::Sender<Result<bool>>),
    Status(oneshot::Sender<NodeStatus>),
    Shutdown(oneshot::Sender<()>),
}

enum ApplyInput {
    Entries { entries: Vec<Entry>, commit_index: u64 },
    Wait { index: u64, term: u64, waiter: Waiter },
    Query {
        index: u64,
        request: QueryRequest,
        reply: Responder,
    },
    Shutdown(oneshot::Sender<()>),
}

/// A client waiting for the entry it proposed to be applied.
enum Waiter {
    Register {
        leader: u64,
        members: Vec<Member>,
        reply: Responder,
    },
    Operation(Responder),
}

impl Waiter {
    fn fail(self, error: &RaftError, leader: Option<u64>) {
        let (reply, response) = match self {
            Waiter::Register { reply, .. } => (reply, Response::Register(RegisterResponse::error(leader, error))),
            Waiter::Operation(reply) => (reply, Response::Operation(OperationResponse::error(leader, error))),
        };
        let _ = reply.send(Ok(response));
    }

    fn shutdown(self) {
        let (Waiter::Register { reply, .. } | Waiter::Operation(reply)) = self;
        let _ = reply.send(Err(RaftError::Shutdown));
    }
}

fn error_response(request: &Request, leader: Option<u64>, error: &RaftError) -> Response {
    match request {
        Request::Register(_) => Response::Register(RegisterResponse::error(leader, error)),
        _ => Response::Operation(OperationResponse::error(leader, error)),
    }
}

fn timed_out(member: u64) -> RaftError {
    RaftError::NetworkFailure {
        member,
        reason: "request timed out".into(),
    }
}

// -- raft task --

struct RaftTask {
    id: u64,
    node: RaftNode,
    transport: Arc<dyn Transport>,
    inputs: mpsc::UnboundedSender<Input>,
    apply: mpsc::UnboundedSender<ApplyInput>,
    timer: Timer,
    scheduled: Option<u64>,
    /// highest commit index handed to the apply task
    handed_over: u64,
    configuration_waiters: HashMap<u64, Responder>,
    leave_waiters: Vec<oneshot::Sender<Result<bool>>>,
    /// queries waiting for a quorum to confirm this leader, by read id
    reads: HashMap<u64, (QueryRequest, Responder)>,
    rpc_timeout: Duration,
    configuration_timeout: Duration,
    _compactor: CompactorHandle,
}

impl RaftTask {
    async fn run(mut self, mut inputs: mpsc::UnboundedReceiver<Input>, mut network: mpsc::UnboundedReceiver<Incoming>) {
        tracing::info!(role = %self.node.role(), term = self.node.term(), "server started");
        self.flush();

        let done = loop {
            let input = tokio::select! {
                Some(input) = inputs.recv() => input,
                Some(incoming) = network.recv() => Input::Request(incoming),
                else => break None,
            };
            if let Input::Shutdown(done) = input {
                break Some(done);
            }

            if let Err(error) = self.node.tick(clock()) {
                tracing::error!(error = %error, "tick failed");
            }
            self.handle(input);
            self.flush();
        };

        self.close(done);
    }

    fn handle(&mut self, input: Input) {
        match input {
            Input::Request(incoming) => self.handle_request(incoming),
            Input::Outcome { to, request, result } => {
                let outcome = match result {
                    Ok(response) => self.node.handle_response(to, &response),
                    Err(error) => {
                        tracing::trace!(member = to, request = request.name(), error = %error, "request failed");
                        self.node.handle_failure(to, &request);
                        Ok(())
                    }
                };
                if let Err(error) = outcome {
                    tracing::error!(member = to, error = %error, "handling response failed");
                }
            }
            // the tick already ran
            Input::Tick => self.scheduled = None,
            Input::Suspects(sessions) => {
                if !self.node.is_leader() {
                    return;
                }
                for session in sessions {
                    if let Err(error) = self.node.expire_session(session) {
                        tracing::warn!(session, error = %error, "expiring session failed");
                    }
                }
            }
            Input::Leave(reply) => match self.node.leave() {
                Ok(()) => self.leave_waiters.push(reply),
                Err(error) => {
                    let _ = reply.send(Err(error));
                }
            },
            Input::Status(reply) => {
                let _ = reply.send(self.node.status());
            }
            Input::Shutdown(_) => {}
        }
    }

    fn handle_request(&mut self, incoming: Incoming) {
        let (from, request, reply) = incoming.into_parts();
        match request {
            Request::Vote(request) => {
                let _ = reply.send(self.node.handle_vote_request(&request).map(Response::Vote));
            }
            Request::Append(request) => {
                let _ = reply.send(self.node.handle_append(&request).map(Response::Append));
            }
            Request::Join(request) => {
                let result = self.node.handle_join(&request);
                self.answer_configuration(result, reply);
            }
            Request::Leave(request) => {
                let result = self.node.handle_leave(&request);
                self.answer_configuration(result, reply);
            }
            request => self.handle_client(from, request, reply),
        }
    }

    fn answer_configuration(&mut self, result: Result<Reply<ConfigurationResponse>>, reply: Responder) {
        match result {
            Ok(Reply::Now(response)) => {
                let _ = reply.send(Ok(Response::Configuration(response)));
            }
            Ok(Reply::AtCommit(index)) => {
                self.configuration_waiters.insert(index, reply);
            }
            Err(error) => {
                let _ = reply.send(Err(error));
            }
        }
    }

    /// Client requests are proposed by the leader. A follower forwards
    /// requests from its own clients to the leader it knows of; anything else
    /// is answered with a leader hint.
    fn handle_client(&mut self, from: u64, request: Request, reply: Responder) {
        let leader = self.node.leader();
        if !self.node.is_leader() {
            match leader.filter(|&leader| leader != self.id && from == self.id) {
                Some(leader) => self.forward(leader, request, reply),
                None => {
                    let error = RaftError::NoLeader { leader };
                    let _ = reply.send(Ok(error_response(&request, leader, &error)));
                }
            }
            return;
        }

        let term = self.node.term();
        let proposed = match &request {
            Request::Register(register) => self.node.register(register.client.clone(), register.timeout),
            Request::KeepAlive(keep_alive) => self.node.keep_alive(keep_alive),
            Request::Command(command) => self.node.command(command),
            Request::Unregister(unregister) => self.node.unregister(unregister.session),
            Request::Query(query) => {
                self.query(query.clone(), reply);
                return;
            }
            other => Err(RaftError::IllegalMemberState(format!("{} is not a client request", other.name()))),
        };

        match proposed {
            Ok(index) => {
                let waiter = match request {
                    Request::Register(_) => Waiter::Register {
                        leader: self.id,
                        members: self.node.cluster().configuration().members,
                        reply,
                    },
                    _ => Waiter::Operation(reply),
                };
                let _ = self.apply.send(ApplyInput::Wait { index, term, waiter });
            }
            Err(error) => {
                let _ = reply.send(Ok(error_response(&request, leader, &error)));
            }
        }
    }

    /// Queries only reach the apply task once a quorum has confirmed this
    /// server still leads, so a deposed leader never answers from stale state.
    fn query(&mut self, request: QueryRequest, reply: Responder) {
        match self.node.read() {
            Ok(id) => {
                self.reads.insert(id, (request, reply));
            }
            Err(error) => {
                let response = OperationResponse::error(self.node.leader(), &error);
                let _ = reply.send(Ok(Response::Operation(response)));
            }
        }
    }

    fn forward(&self, leader: u64, request: Request, reply: Responder) {
        tracing::trace!(leader, request = request.name(), "forwarding to leader");
        let call = self.transport.send(self.id, leader, request);
        let timeout = self.configuration_timeout;
        tokio::spawn(async move {
            let result = tokio::time::timeout(timeout, call)
                .await
                .unwrap_or_else(|_| Err(timed_out(leader)));
            let _ = reply.send(result);
        });
    }

    fn send(&self, to: u64, request: Request) {
        let timeout = match request {
            Request::Join(_) | Request::Leave(_) => self.configuration_timeout,
            _ => self.rpc_timeout,
        };
        let call = self.transport.send(self.id, to, request.clone());
        let inputs = self.inputs.clone();
        tokio::spawn(async move {
            let result = tokio::time::timeout(timeout, call)
                .await
                .unwrap_or_else(|_| Err(timed_out(to)));
            let _ = inputs.send(Input::Outcome { to, request, result });
        });
    }

    /// Ships everything the last step produced: requests, committed entries,
    /// finished membership changes, and the next wake-up.
    fn flush(&mut self) {
        for (to, request) in self.node.take_messages() {
            self.send(to, request);
        }

        let commit_index = self.node.commit_index();
        if commit_index > self.handed_over {
            match self.node.get_entries_to_apply() {
                Ok(entries) => {
                    self.handed_over = commit_index;
                    let _ = self.apply.send(ApplyInput::Entries { entries, commit_index });
                }
                Err(error) => tracing::error!(commit_index, error = %error, "reading committed entries failed"),
            }
        }

        for completion in self.node.take_completions() {
            self.complete(completion);
        }
        self.reschedule();
    }

    fn complete(&mut self, completion: Completion) {
        match completion {
            Completion::Configuration { index, response } => {
                if let Some(reply) = self.configuration_waiters.remove(&index) {
                    let _ = reply.send(Ok(Response::Configuration(response)));
                }
            }
            Completion::Joined(true) => tracing::info!(term = self.node.term(), "joined cluster"),
            Completion::Joined(false) => tracing::warn!("gave up joining the cluster"),
            Completion::Left { committed } => {
                for reply in self.leave_waiters.drain(..) {
                    let _ = reply.send(Ok(committed));
                }
            }
            Completion::Read { id, index } => {
                let Some((request, reply)) = self.reads.remove(&id) else {
                    return;
                };
                match index {
                    Some(index) => {
                        let index = index.max(request.version);
                        let _ = self.apply.send(ApplyInput::Query { index, request, reply });
                    }
                    None => {
                        let leader = self.node.leader();
                        tracing::debug!(id, leader = ?leader, "read lost leadership");
                        let error = RaftError::NoLeader { leader };
                        let _ = reply.send(Ok(Response::Operation(OperationResponse::error(leader, &error))));
                    }
                }
            }
        }
    }

    fn reschedule(&mut self) {
        let deadline = self.node.next_deadline();
        if deadline == self.scheduled {
            return;
        }
        self.scheduled = deadline;
        let Some(deadline) = deadline else {
            self.timer.cancel();
            return;
        };

        let delay = Duration::from_millis(deadline.saturating_sub(clock()).max(1));
        let inputs = self.inputs.clone();
        self.timer.schedule(delay, move || {
            let _ = inputs.send(Input::Tick);
        });
    }

    fn close(mut self, done: Option<oneshot::Sender<()>>) {
        self.timer.cancel();
        self.transport.unbind(self.id);
        if let Err(error) = self.node.log().flush() {
            tracing::warn!(error = %error, "flushing log on shutdown failed");
        }
        for (_, reply) in self.configuration_waiters.drain() {
            let _ = reply.send(Err(RaftError::Shutdown));
        }
        for reply in self.leave_waiters.drain(..) {
            let _ = reply.send(Err(RaftError::Shutdown));
        }
        for (_, (_, reply)) in self.reads.drain() {
            let _ = reply.send(Err(RaftError::Shutdown));
        }

        let (applied, stopped) = oneshot::channel();
        if self.apply.send(ApplyInput::Shutdown(applied)).is_ok() {
            tokio::spawn(async move {
                let _ = stopped.await;
                if let Some(done) = done {
                    let _ = done.send(());
                }
            });
        } else if let Some(done) = done {
            let _ = done.send(());
        }
        tracing::info!("server stopped");
    }
}

// -- apply task --

struct ApplyTask {
    executor: Executor,
    log: Arc<Log>,
    raft: mpsc::UnboundedSender<Input>,
    events: broadcast::Sender<PublishRequest>,
    waiters: BTreeMap<u64, (u64, Waiter)>,
    queries: HashMap<u64, Responder>,
    next_ticket: u64,
}

impl ApplyTask {
    async fn run(mut self, mut inputs: mpsc::UnboundedReceiver<ApplyInput>) {
        while let Some(input) = inputs.recv().await {
            match input {
                ApplyInput::Entries { entries, commit_index } => self.apply(entries, commit_index),
                ApplyInput::Wait { index, term, waiter } => {
                    if index <= self.executor.last_applied() {
                        waiter.fail(&RaftError::NoLeader { leader: None }, None);
                    } else {
                        self.waiters.insert(index, (term, waiter));
                    }
                }
                ApplyInput::Query { index, request, reply } => {
                    self.next_ticket += 1;
                    let ticket = self.next_ticket;
                    match self.executor.query(ticket, index, request) {
                        Some(result) => answer_query(reply, result),
                        None => {
                            self.queries.insert(ticket, reply);
                        }
                    }
                }
                ApplyInput::Shutdown(done) => {
                    self.close();
                    let _ = done.send(());
                    return;
                }
            }
        }
        self.close();
    }

    fn apply(&mut self, entries: Vec<Entry>, commit_index: u64) {
        for entry in entries {
            let index = entry.index;
            match self.executor.apply(entry) {
                Ok(applied) => self.complete(applied),
                Err(error) => tracing::error!(index, error = %error, "applying entry failed"),
            }
        }
        self.executor.advance(commit_index);

        // proposed entries that were never applied were lost to a new leader
        let last_applied = self.executor.last_applied();
        let pending = self.waiters.split_off(&(last_applied + 1));
        for (_, (_, waiter)) in std::mem::replace(&mut self.waiters, pending) {
            waiter.fail(&RaftError::NoLeader { leader: None }, None);
        }

        for (ticket, result) in self.executor.take_ready_queries() {
            if let Some(reply) = self.queries.remove(&ticket) {
                answer_query(reply, result);
            }
        }
        for publish in self.executor.take_published() {
            // nobody listening is fine
            let _ = self.events.send(publish);
        }
        let suspects = self.executor.take_suspects();
        if !suspects.is_empty() {
            let _ = self.raft.send(Input::Suspects(suspects));
        }
        self.log.compactor().set_major_index(self.executor.last_completed());
    }

    fn complete(&mut self, applied: Applied) {
        let Some((term, waiter)) = self.waiters.remove(&applied.index) else {
            return;
        };
        if term != applied.term {
            tracing::debug!(index = applied.index, term, applied = applied.term, "proposal replaced by another leader");
            waiter.fail(&RaftError::NoLeader { leader: None }, None);
            return;
        }

        match (waiter, applied.result) {
            (Waiter::Register { leader, members, reply }, Ok(Output::Session(session))) => {
                let timeout = self
                    .executor
                    .sessions()
                    .get(session)
                    .map(|session| session.timeout())
                    .unwrap_or_default();
                let response = RegisterResponse::ok(Some(leader), session, timeout, members);
                let _ = reply.send(Ok(Response::Register(response)));
            }
            (Waiter::Operation(reply), Ok(output)) => {
                let result = match output {
                    Output::Value(value) => value,
                    Output::None | Output::Session(_) => Vec::new(),
                };
                let _ = reply.send(Ok(Response::Operation(OperationResponse::ok(applied.index, result))));
            }
            (waiter, Ok(_)) => {
                waiter.fail(&RaftError::IllegalMemberState("unexpected apply output".into()), None);
            }
            (waiter, Err(error)) => waiter.fail(&error, None),
        }
    }

    fn close(&mut self) {
        for (ticket, result) in self.executor.cancel_queries() {
            if let Some(reply) = self.queries.remove(&ticket) {
                answer_query(reply, result);
            }
        }
        for (_, reply) in self.queries.drain() {
            let _ = reply.send(Err(RaftError::Shutdown));
        }
        for (_, (_, waiter)) in std::mem::take(&mut self.waiters) {
            waiter.shutdown();
        }
    }
}

fn answer_query(reply: Responder, result: QueryResult) {
    let response = match result {
        Ok((index, result)) => Ok(Response::Operation(OperationResponse::ok(index, result))),
        Err(RaftError::Shutdown) => Err(RaftError::Shutdown),
        Err(error) => Ok(Response::Operation(OperationResponse::error(None, &error))),
    };
    let _ = reply.send(response);
}

// -- public surface --

/// Starts raft servers.
#[derive(Debug)]
pub struct RaftServer;

impl RaftServer {
    /// Opens the server's log, binds it to `transport` and spawns its tasks.
    /// A server that is not one of the configured members asks them to add
    /// it. Needs a tokio runtime.
    pub fn start(
        config: ServerConfig,
        state_machine: Box<dyn StateMachine>,
        transport: Arc<dyn Transport>,
    ) -> Result<ServerHandle> {
        config.validate()?;

        let log = Arc::new(Storage::new(config.storage.clone()).open(LOG_NAME)?);
        let mut node = RaftNode::new(&config, Arc::clone(&log))?;
        let network = transport.bind(config.id)?;
        node.open(clock());

        let (inputs, input_receiver) = mpsc::unbounded_channel();
        let (apply, apply_receiver) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let span = tracing::info_span!("raft", member = config.id);

        let apply_task = ApplyTask {
            executor: Executor::new(Arc::clone(&log), state_machine),
            log: Arc::clone(&log),
            raft: inputs.clone(),
            events: events.clone(),
            waiters: BTreeMap::new(),
            queries: HashMap::new(),
            next_ticket: 0,
        };
        tokio::spawn(apply_task.run(apply_receiver).instrument(span.clone()));

        let raft_task = RaftTask {
            id: config.id,
            node,
            transport,
            inputs: inputs.clone(),
            apply,
            timer: Timer::new(),
            scheduled: None,
            handed_over: 0,
            configuration_waiters: HashMap::new(),
            leave_waiters: Vec::new(),
            reads: HashMap::new(),
            rpc_timeout: Duration::from_millis(config.raft.election_timeout_max),
            configuration_timeout: Duration::from_millis(config.raft.configuration_timeout),
            _compactor: Compactor::spawn(log),
        };
        tokio::spawn(raft_task.run(input_receiver, network).instrument(span));

        Ok(ServerHandle {
            id: config.id,
            inputs,
            events,
            timeout: Duration::from_millis(config.raft.configuration_timeout),
            retry_interval: config.raft.heartbeat() * 2,
        })
    }
}

/// Client and admin access to a running server. Clones share the server.
///
/// client operations go to the leader through this server. they are retried
/// while no leader is known, until the configuration timeout runs out.
#[derive(Debug, Clone)]
pub struct ServerHandle {
    id: u64,
    inputs: mpsc::UnboundedSender<Input>,
    events: broadcast::Sender<PublishRequest>,
    timeout: Duration,
    retry_interval: Duration,
}

impl ServerHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    async fn call(&self, request: Request) -> Result<Response> {
        let (incoming, response) = Incoming::new(self.id, request);
        self.inputs
            .send(Input::Request(incoming))
            .map_err(|_| RaftError::Shutdown)?;
        match tokio::time::timeout(self.timeout, response).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(RaftError::Shutdown),
            Err(_) => Err(timed_out(self.id)),
        }
    }

    async fn submit<T>(&self, request: Request, parse: impl Fn(Response) -> Result<T>) -> Result<T> {
        let deadline = tokio::time::Instant::now() + self.timeout;
        loop {
            match self.call(request.clone()).await.and_then(&parse) {
                Err(RaftError::NoLeader { .. }) if tokio::time::Instant::now() + self.retry_interval < deadline => {
                    tokio::time::sleep(self.retry_interval).await;
                }
                result => return result,
            }
        }
    }

    /// Opens a session. A zero timeout takes the configured session timeout.
    pub async fn register(&self, client: impl Into<String>, timeout: Duration) -> Result<u64> {
        let request = Request::Register(RegisterRequest {
            client: client.into(),
            timeout: timeout.as_millis() as u64,
        });
        self.submit(request, |response| match response {
            Response::Register(response) => response.into_result(),
            other => Err(unexpected(&other)),
        })
        .await
    }

    /// Keeps a session alive and acknowledges what the client has seen.
    pub async fn keep_alive(&self, session: u64, command_sequence: u64, event_version: u64) -> Result<()> {
        let request = Request::KeepAlive(KeepAliveRequest {
            session,
            command_sequence,
            event_version,
        });
        self.submit(request, operation).await.map(|_| ())
    }

    /// Runs a command. Returns the index it was applied at and its result.
    pub async fn command(&self, request: CommandRequest) -> Result<(u64, Vec<u8>)> {
        self.submit(Request::Command(request), operation).await
    }

    /// Runs a read-only query on the leader.
    pub async fn query(&self, request: QueryRequest) -> Result<(u64, Vec<u8>)> {
        self.submit(Request::Query(request), operation).await
    }

    pub async fn unregister(&self, session: u64) -> Result<()> {
        let request = Request::Unregister(UnregisterRequest { session });
        self.submit(request, operation).await.map(|_| ())
    }

    /// Leaves the cluster. Resolves once the server is inactive; true when
    /// its removal committed.
    pub async fn leave(&self) -> Result<bool> {
        let (reply, left) = oneshot::channel();
        self.inputs.send(Input::Leave(reply)).map_err(|_| RaftError::Shutdown)?;
        match tokio::time::timeout(self.timeout * 2, left).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(RaftError::Shutdown),
            Err(_) => Err(timed_out(self.id)),
        }
    }

    pub async fn status(&self) -> Result<NodeStatus> {
        let (reply, status) = oneshot::channel();
        self.inputs.send(Input::Status(reply)).map_err(|_| RaftError::Shutdown)?;
        status.await.map_err(|_| RaftError::Shutdown)
    }

    /// Event batches published by the state machine from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<PublishRequest> {
        self.events.subscribe()
    }

    /// Stops the server's tasks. Waiting requests fail with Shutdown.
    pub async fn shutdown(&self) -> Result<()> {
        let (done, stopped) = oneshot::channel();
        self.inputs.send(Input::Shutdown(done)).map_err(|_| RaftError::Shutdown)?;
        let _ = stopped.await;
        Ok(())
    }
}

fn operation(response: Response) -> Result<(u64, Vec<u8>)> {
    match response {
        Response::Operation(response) => response.into_result(),
        other => Err(unexpected(&other)),
    }
}

fn unexpected(response: &Response) -> RaftError {
    RaftError::IllegalMemberState(format!("unexpected response {response:?}"))
}
