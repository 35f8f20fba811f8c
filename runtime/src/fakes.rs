/* -------------------------------------------------------------------------- *\
 *                |   █████╗ ██╗   ██╗██████╗  █████╗ ███████╗ |              *
 *                |  ██╔══██╗██║   ██║██╔══██╗██╔══██╗██╔════╝ |              *
 *                |  ███████║██║   ██║██████╔╝███████║█████╗   |              *
 *                |  ██╔══██║██║   ██║██╔══██╗██╔══██║██╔══╝   |              *
 *                |  ██║  ██║╚██████╔╝██║  ██║██║  ██║███████╗ |              *
 *                |  ╚═╝  ╚═╝ ╚═════╝ ╚═╝  ╚═╝╚═╝  ╚═╝╚══════╝ |              *
 *                +--------------------------------------------+              *
 *                                                                            *
 *                         Distributed Systems Runtime                        *
 * -------------------------------------------------------------------------- *
 * Copyright 2022 - 2024, the aurae contributors                              *
 * SPDX-License-Identifier: Apache-2.0                                        *
\* -------------------------------------------------------------------------- */

//! In-memory stand-ins for the runtime client and the collaborators of the
//! backend.
//!
//! Fakes sharing a [Journal] record their calls into it in order, prefixed
//! with their scope ("client", "container", "task", ...), so tests can
//! assert on the ordering of operations spanning several of them.

use crate::{
    client::{
        Client, ClientError, ExitReceiver, ExitStatus, FifoSet, Io, IoAttach,
        IoCreator, ProcessInfo, ProcessStatus, Result, RuntimeContainer, Task,
        TaskProcess,
    },
    filestore::FileStoreError,
    killer::{KillBehaviour, Killer, KillerError, ProcessKiller},
    network::{
        Cni, CniError, CniResult, InterfaceConfig, IpConfig, Iptables,
        IptablesError, Network, NetworkError,
    },
    rootfs::{PasswdUser, RootfsError, RootfsManager},
    userns::{UserNamespace, UserNamespaceError},
};
use async_trait::async_trait;
use nix::sys::signal::Signal;
use oci_spec::runtime::{Mount, MountBuilder, Process as OciProcess, Spec};
use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    io,
    net::IpAddr,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex, MutexGuard,
    },
    time::Duration,
};
use tokio::sync::oneshot;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().expect("fake state lock")
}

/// Ordered log of calls shared between fakes.
#[derive(Debug, Clone, Default)]
pub struct Journal(Arc<Mutex<Vec<String>>>);

impl Journal {
    pub fn record(&self, event: String) {
        lock(&self.0).push(event);
    }

    pub fn events(&self) -> Vec<String> {
        lock(&self.0).clone()
    }
}

/// Calls of a single fake, mirrored into its journal under `scope`.
#[derive(Debug)]
struct Calls {
    scope: &'static str,
    local: Mutex<Vec<String>>,
    journal: Journal,
}

impl Calls {
    fn new(scope: &'static str, journal: Journal) -> Self {
        Self { scope, local: Mutex::new(Vec::new()), journal }
    }

    fn record(&self, call: impl Into<String>) {
        let call = call.into();
        self.journal.record(format!("{} {call}", self.scope));
        lock(&self.local).push(call);
    }

    fn all(&self) -> Vec<String> {
        lock(&self.local).clone()
    }
}

/// Operations told to fail, keyed by operation name.
#[derive(Debug, Default)]
struct Failures(Mutex<HashMap<String, String>>);

impl Failures {
    fn set(&self, op: &str, message: &str) {
        let _ = lock(&self.0).insert(op.to_string(), message.to_string());
    }

    fn check(&self, op: &str) -> Result<()> {
        match lock(&self.0).get(op) {
            Some(message) => Err(ClientError::Other(message.clone())),
            None => Ok(()),
        }
    }
}

pub type EventLog = Arc<Mutex<Vec<String>>>;

pub struct FakeIo {
    name: String,
    log: EventLog,
    cancels: AtomicUsize,
    closes: AtomicUsize,
    waits: AtomicUsize,
}

impl FakeIo {
    pub fn new(name: &str) -> Arc<Self> {
        Self::with_log(name, Self::shared_log())
    }

    pub fn shared_log() -> EventLog {
        Arc::new(Mutex::new(Vec::new()))
    }

    pub fn with_log(name: &str, log: EventLog) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            log,
            cancels: AtomicUsize::new(0),
            closes: AtomicUsize::new(0),
            waits: AtomicUsize::new(0),
        })
    }

    pub fn record(&self, event: &str) {
        lock(&self.log).push(format!("{}:{event}", self.name));
    }

    pub fn events(log: &EventLog) -> Vec<String> {
        lock(log).clone()
    }

    pub fn cancel_calls(&self) -> usize {
        self.cancels.load(Ordering::SeqCst)
    }

    pub fn close_calls(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn wait_calls(&self) -> usize {
        self.waits.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Io for FakeIo {
    fn config(&self) -> FifoSet {
        FifoSet { id: self.name.clone(), ..FifoSet::default() }
    }

    fn cancel(&self) {
        self.record("cancel");
        let _ = self.cancels.fetch_add(1, Ordering::SeqCst);
    }

    async fn wait(&self) {
        let _ = self.waits.fetch_add(1, Ordering::SeqCst);
    }

    fn close(&self) -> io::Result<()> {
        self.record("close");
        let _ = self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub struct FakeProcess {
    id: String,
    calls: Mutex<Vec<String>>,
    failures: Failures,
    status: Mutex<ProcessStatus>,
    exited: Mutex<Option<ExitStatus>>,
    exit_on_signal: Mutex<Option<ExitStatus>>,
    // kept alive so pending receivers never observe a closed channel
    waiters: Mutex<Vec<oneshot::Sender<Result<ExitStatus>>>>,
    delete_not_found: AtomicBool,
    io: Mutex<Option<Arc<dyn Io>>>,
}

impl FakeProcess {
    pub fn new(id: &str) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            calls: Mutex::new(Vec::new()),
            failures: Failures::default(),
            status: Mutex::new(ProcessStatus::Running),
            exited: Mutex::new(None),
            exit_on_signal: Mutex::new(None),
            waiters: Mutex::new(Vec::new()),
            delete_not_found: AtomicBool::new(false),
            io: Mutex::new(None),
        })
    }

    /// A receiver for the exit status, without recording a call.
    pub fn wait_receiver(&self) -> ExitReceiver {
        let (tx, rx) = oneshot::channel();
        match *lock(&self.exited) {
            Some(status) => {
                let _ = tx.send(Ok(status));
            }
            None => lock(&self.waiters).push(tx),
        }
        rx
    }

    pub fn exit(&self, status: ExitStatus) {
        *lock(&self.exited) = Some(status);
        *lock(&self.status) = ProcessStatus::Stopped;
        for tx in lock(&self.waiters).drain(..) {
            let _ = tx.send(Ok(status));
        }
    }

    pub fn exit_on_signal(&self, status: ExitStatus) {
        *lock(&self.exit_on_signal) = Some(status);
    }

    pub fn fail_kill(&self, message: &str) {
        self.failures.set("kill", message);
    }

    pub fn fail_start(&self, message: &str) {
        self.failures.set("start", message);
    }

    pub fn fail_delete(&self, message: &str) {
        self.failures.set("delete", message);
    }

    pub fn fail_delete_not_found(&self) {
        self.delete_not_found.store(true, Ordering::SeqCst);
    }

    pub fn set_status(&self, status: ProcessStatus) {
        *lock(&self.status) = status;
    }

    pub fn set_io(&self, io: Arc<dyn Io>) {
        *lock(&self.io) = Some(io);
    }

    pub fn calls(&self) -> Vec<String> {
        lock(&self.calls).clone()
    }

    fn record(&self, call: impl Into<String>) {
        lock(&self.calls).push(call.into());
    }
}

#[async_trait]
impl TaskProcess for FakeProcess {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn pid(&self) -> u32 {
        4242
    }

    async fn start(&self) -> Result<()> {
        self.record("start");
        self.failures.check("start")
    }

    async fn wait(&self) -> Result<ExitReceiver> {
        self.record("wait");
        Ok(self.wait_receiver())
    }

    async fn kill(&self, signal: Signal) -> Result<()> {
        self.record(format!("kill {signal:?}"));
        self.failures.check("kill")?;
        let on_signal = *lock(&self.exit_on_signal);
        if let Some(status) = on_signal {
            self.exit(status);
        }
        Ok(())
    }

    async fn status(&self) -> Result<ProcessStatus> {
        Ok(*lock(&self.status))
    }

    async fn close_io(&self) -> Result<()> {
        self.record("close_io");
        Ok(())
    }

    async fn resize(&self, width: u32, height: u32) -> Result<()> {
        self.record(format!("resize {width}x{height}"));
        Ok(())
    }

    async fn delete(&self) -> Result<ExitStatus> {
        self.record("delete");
        self.failures.check("delete")?;
        if self.delete_not_found.load(Ordering::SeqCst) {
            return Err(ClientError::not_found(format!("process {}", self.id)));
        }
        let exited = *lock(&self.exited);
        Ok(exited.unwrap_or(ExitStatus { code: 0 }))
    }

    fn io(&self) -> Option<Arc<dyn Io>> {
        lock(&self.io).clone()
    }
}

pub struct FakeTask {
    id: String,
    pid: u32,
    calls: Calls,
    failures: Failures,
    pids: Mutex<Vec<ProcessInfo>>,
    processes: Mutex<HashMap<String, Arc<FakeProcess>>>,
    prepared: Mutex<VecDeque<Arc<FakeProcess>>>,
    exec_specs: Mutex<Vec<OciProcess>>,
    loaded: Mutex<Vec<String>>,
}

impl FakeTask {
    pub fn new(id: &str, pid: u32) -> Arc<Self> {
        Self::with_journal(id, pid, Journal::default())
    }

    pub fn with_journal(id: &str, pid: u32, journal: Journal) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            pid,
            calls: Calls::new("task", journal),
            failures: Failures::default(),
            pids: Mutex::new(Vec::new()),
            processes: Mutex::new(HashMap::new()),
            prepared: Mutex::new(VecDeque::new()),
            exec_specs: Mutex::new(Vec::new()),
            loaded: Mutex::new(Vec::new()),
        })
    }

    pub fn set_pids(&self, pids: Vec<ProcessInfo>) {
        *lock(&self.pids) = pids;
    }

    pub fn fail_pids(&self, message: &str) {
        self.failures.set("pids", message);
    }

    /// Makes `process` loadable by its id.
    pub fn add_process(&self, process: Arc<FakeProcess>) {
        let _ = lock(&self.processes).insert(process.id(), process);
    }

    /// Queues `process` to be handed out by the next exec.
    pub fn prepare_exec(&self, process: Arc<FakeProcess>) {
        lock(&self.prepared).push_back(process);
    }

    pub fn process(&self, id: &str) -> Option<Arc<FakeProcess>> {
        lock(&self.processes).get(id).cloned()
    }

    pub fn exec_specs(&self) -> Vec<OciProcess> {
        lock(&self.exec_specs).clone()
    }

    pub fn loaded_processes(&self) -> Vec<String> {
        lock(&self.loaded).clone()
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.all()
    }
}

#[async_trait]
impl Task for FakeTask {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn pid(&self) -> u32 {
        self.pid
    }

    async fn start(&self) -> Result<()> {
        self.calls.record("start");
        self.failures.check("start")
    }

    async fn exec(
        &self,
        id: &str,
        spec: OciProcess,
        creator: IoCreator,
    ) -> Result<Arc<dyn TaskProcess>> {
        self.calls.record(format!("exec {id}"));
        let io = creator(id)?;

        let prepared = lock(&self.prepared).pop_front();
        let process = prepared.unwrap_or_else(|| FakeProcess::new(id));
        process.set_io(io);

        lock(&self.exec_specs).push(spec);
        self.add_process(Arc::clone(&process));
        Ok(process as Arc<dyn TaskProcess>)
    }

    async fn load_process(
        &self,
        id: &str,
        attach: Option<IoAttach>,
    ) -> Result<Arc<dyn TaskProcess>> {
        lock(&self.loaded).push(id.to_string());
        let Some(process) = self.process(id) else {
            return Err(ClientError::not_found(format!("process {id}")));
        };

        if let Some(attach) = attach {
            let fifos = FifoSet { id: id.to_string(), ..FifoSet::default() };
            process.set_io(attach(&fifos)?);
        }
        Ok(process as Arc<dyn TaskProcess>)
    }

    async fn pids(&self) -> Result<Vec<ProcessInfo>> {
        self.failures.check("pids")?;
        Ok(lock(&self.pids).clone())
    }

    async fn delete(&self) -> Result<ExitStatus> {
        self.calls.record("delete");
        self.failures.check("delete")?;
        Ok(ExitStatus { code: 0 })
    }
}

pub struct FakeRuntimeContainer {
    id: String,
    journal: Journal,
    calls: Calls,
    failures: Failures,
    spec: Mutex<Spec>,
    labels: Mutex<HashMap<String, String>>,
    task: Mutex<Option<Arc<FakeTask>>>,
}

impl FakeRuntimeContainer {
    pub fn new(id: &str) -> Arc<Self> {
        Self::with_journal(id, Spec::default(), HashMap::new(), Journal::default())
    }

    fn with_journal(
        id: &str,
        spec: Spec,
        labels: HashMap<String, String>,
        journal: Journal,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            calls: Calls::new("container", journal.clone()),
            journal,
            failures: Failures::default(),
            spec: Mutex::new(spec),
            labels: Mutex::new(labels),
            task: Mutex::new(None),
        })
    }

    pub fn set_spec(&self, spec: Spec) {
        *lock(&self.spec) = spec;
    }

    pub fn current_spec(&self) -> Spec {
        lock(&self.spec).clone()
    }

    pub fn set_task(&self, task: Arc<FakeTask>) {
        *lock(&self.task) = Some(task);
    }

    pub fn clear_task(&self) {
        *lock(&self.task) = None;
    }

    pub fn current_task(&self) -> Option<Arc<FakeTask>> {
        lock(&self.task).clone()
    }

    pub fn label(&self, key: &str) -> Option<String> {
        lock(&self.labels).get(key).cloned()
    }

    pub fn insert_labels(&self, labels: HashMap<String, String>) {
        lock(&self.labels).extend(labels);
    }

    pub fn fail(&self, op: &str) {
        self.failures.set(op, &format!("fake {op} failure"));
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.all()
    }
}

#[async_trait]
impl RuntimeContainer for FakeRuntimeContainer {
    fn id(&self) -> String {
        self.id.clone()
    }

    async fn spec(&self) -> Result<Spec> {
        Ok(self.current_spec())
    }

    async fn labels(&self) -> Result<HashMap<String, String>> {
        Ok(lock(&self.labels).clone())
    }

    async fn set_labels(
        &self,
        labels: HashMap<String, String>,
    ) -> Result<HashMap<String, String>> {
        self.failures.check("set_labels")?;
        let mut current = lock(&self.labels);
        current.extend(labels);
        Ok(current.clone())
    }

    async fn task(&self, _attach: Option<IoAttach>) -> Result<Arc<dyn Task>> {
        match self.current_task() {
            Some(task) => Ok(task as Arc<dyn Task>),
            None => Err(ClientError::not_found(format!("task {}", self.id))),
        }
    }

    async fn new_task(&self, creator: IoCreator) -> Result<Arc<dyn Task>> {
        self.calls.record("new_task");
        self.failures.check("new_task")?;
        let _io = creator(&self.id)?;

        let task = FakeTask::with_journal(&self.id, 1234, self.journal.clone());
        self.set_task(Arc::clone(&task));
        Ok(task as Arc<dyn Task>)
    }

    async fn delete(&self) -> Result<()> {
        self.calls.record("delete");
        self.failures.check("delete")
    }
}

pub struct FakeClient {
    journal: Journal,
    calls: Calls,
    failures: Failures,
    create_delay: Mutex<Duration>,
    containers: Mutex<BTreeMap<String, Arc<FakeRuntimeContainer>>>,
    filters: Mutex<Vec<Vec<String>>>,
    lookups: Mutex<Vec<String>>,
}

impl FakeClient {
    pub fn new() -> Arc<Self> {
        let journal = Journal::default();
        Arc::new(Self {
            calls: Calls::new("client", journal.clone()),
            journal,
            failures: Failures::default(),
            create_delay: Mutex::new(Duration::ZERO),
            containers: Mutex::new(BTreeMap::new()),
            filters: Mutex::new(Vec::new()),
            lookups: Mutex::new(Vec::new()),
        })
    }

    pub fn journal(&self) -> Journal {
        self.journal.clone()
    }

    pub fn fail(&self, op: &str) {
        self.failures.set(op, &format!("fake {op} failure"));
    }

    /// Makes every container creation take at least `delay`.
    pub fn set_create_delay(&self, delay: Duration) {
        *lock(&self.create_delay) = delay;
    }

    pub fn add_container(&self, container: Arc<FakeRuntimeContainer>) {
        let _ = lock(&self.containers).insert(container.id(), container);
    }

    pub fn container(&self, handle: &str) -> Option<Arc<FakeRuntimeContainer>> {
        lock(&self.containers).get(handle).cloned()
    }

    pub fn filters(&self) -> Vec<Vec<String>> {
        lock(&self.filters).clone()
    }

    pub fn lookups(&self) -> Vec<String> {
        lock(&self.lookups).clone()
    }
}

fn matches_filter(labels: &HashMap<String, String>, filter: &str) -> bool {
    let Some((key, value)) =
        filter.strip_prefix("labels.").and_then(|f| f.split_once("=="))
    else {
        return false;
    };
    labels.get(key).is_some_and(|label| label == value)
}

#[async_trait]
impl Client for FakeClient {
    async fn init(&self) -> Result<()> {
        self.calls.record("init");
        self.failures.check("init")
    }

    async fn version(&self) -> Result<String> {
        self.calls.record("version");
        self.failures.check("version")?;
        Ok("v1.7.0".to_string())
    }

    async fn stop(&self) -> Result<()> {
        self.calls.record("stop");
        self.failures.check("stop")
    }

    async fn new_container(
        &self,
        handle: &str,
        labels: HashMap<String, String>,
        spec: Spec,
    ) -> Result<Arc<dyn RuntimeContainer>> {
        let delay = *lock(&self.create_delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        self.calls.record(format!("new_container {handle}"));
        self.failures.check("new_container")?;

        let mut containers = lock(&self.containers);
        if containers.contains_key(handle) {
            return Err(ClientError::AlreadyExists {
                what: format!("container {handle}"),
            });
        }
        let container = FakeRuntimeContainer::with_journal(
            handle,
            spec,
            labels,
            self.journal.clone(),
        );
        let _ = containers.insert(handle.to_string(), Arc::clone(&container));
        Ok(container as Arc<dyn RuntimeContainer>)
    }

    async fn get_container(
        &self,
        handle: &str,
    ) -> Result<Arc<dyn RuntimeContainer>> {
        self.calls.record(format!("get_container {handle}"));
        lock(&self.lookups).push(handle.to_string());
        match self.container(handle) {
            Some(container) => Ok(container as Arc<dyn RuntimeContainer>),
            None => Err(ClientError::not_found(format!("container {handle}"))),
        }
    }

    async fn containers(
        &self,
        filters: &[String],
    ) -> Result<Vec<Arc<dyn RuntimeContainer>>> {
        // not journaled, capacity checks would otherwise show up in orderings
        lock(&self.filters).push(filters.to_vec());
        self.failures.check("containers")?;

        let containers: Vec<_> =
            lock(&self.containers).values().cloned().collect();
        Ok(containers
            .into_iter()
            .filter(|container| {
                let labels = lock(&container.labels).clone();
                filters.iter().all(|filter| matches_filter(&labels, filter))
            })
            .map(|container| container as Arc<dyn RuntimeContainer>)
            .collect())
    }
}

/// Replays scripted results, then succeeds.
pub struct FakeProcessKiller {
    results: Mutex<VecDeque<std::result::Result<(), KillerError>>>,
    calls: Mutex<Vec<(String, Signal)>>,
}

impl FakeProcessKiller {
    pub fn new(
        results: Vec<std::result::Result<(), KillerError>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            results: Mutex::new(results.into()),
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self) -> Vec<(String, Signal)> {
        lock(&self.calls).clone()
    }
}

#[async_trait]
impl ProcessKiller for FakeProcessKiller {
    async fn kill(
        &self,
        process: &dyn TaskProcess,
        signal: Signal,
        _wait: Duration,
    ) -> std::result::Result<(), KillerError> {
        lock(&self.calls).push((process.id(), signal));
        lock(&self.results).pop_front().unwrap_or(Ok(()))
    }
}

pub struct FakeKiller {
    calls: Calls,
    failure: Mutex<Option<String>>,
}

impl FakeKiller {
    pub fn new() -> Arc<Self> {
        Self::with_journal(Journal::default())
    }

    pub fn with_journal(journal: Journal) -> Arc<Self> {
        Arc::new(Self {
            calls: Calls::new("killer", journal),
            failure: Mutex::new(None),
        })
    }

    pub fn fail(&self, message: &str) {
        *lock(&self.failure) = Some(message.to_string());
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.all()
    }
}

#[async_trait]
impl Killer for FakeKiller {
    async fn kill(
        &self,
        task: &dyn Task,
        behaviour: KillBehaviour,
    ) -> std::result::Result<(), KillerError> {
        self.calls.record(format!("kill {} {behaviour:?}", task.id()));
        match lock(&self.failure).clone() {
            Some(message) => Err(KillerError::ListProcesses {
                source: ClientError::Other(message),
            }),
            None => Ok(()),
        }
    }
}

pub struct FakeNetwork {
    calls: Calls,
    fail_prefix: Mutex<Option<String>>,
    without_ip: AtomicBool,
}

impl FakeNetwork {
    pub fn with_journal(journal: Journal) -> Arc<Self> {
        Arc::new(Self {
            calls: Calls::new("network", journal),
            fail_prefix: Mutex::new(None),
            without_ip: AtomicBool::new(false),
        })
    }

    /// Fails every call starting with `prefix`.
    pub fn fail_on(&self, prefix: &str) {
        *lock(&self.fail_prefix) = Some(prefix.to_string());
    }

    /// Makes resuming traffic fail as if the container never got an ip.
    pub fn resume_without_ip(&self) {
        self.without_ip.store(true, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.all()
    }

    fn call(&self, call: String) -> std::result::Result<(), NetworkError> {
        self.calls.record(call.clone());
        match lock(&self.fail_prefix).as_deref() {
            Some(prefix) if call.starts_with(prefix) => {
                Err(NetworkError::InvalidInput(format!("fake {call} failure")))
            }
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl Network for FakeNetwork {
    async fn setup_host_network(&self) -> std::result::Result<(), NetworkError> {
        self.call("setup-host".to_string())
    }

    async fn setup_mounts(
        &self,
        handle: &str,
    ) -> std::result::Result<Vec<Mount>, NetworkError> {
        self.call(format!("mounts {handle}"))?;
        let hosts = MountBuilder::default()
            .destination("/etc/hosts")
            .typ("bind")
            .source(PathBuf::from("/tmp").join(handle).join("hosts"))
            .options(vec!["bind".to_string(), "rw".to_string()])
            .build()?;
        Ok(vec![hosts])
    }

    async fn add(
        &self,
        _task: &dyn Task,
        handle: &str,
    ) -> std::result::Result<(), NetworkError> {
        self.call(format!("add {handle}"))
    }

    async fn remove(
        &self,
        _task: &dyn Task,
        handle: &str,
    ) -> std::result::Result<(), NetworkError> {
        self.call(format!("remove {handle}"))
    }

    async fn drop_container_traffic(
        &self,
        handle: &str,
    ) -> std::result::Result<(), NetworkError> {
        self.call(format!("drop {handle}"))
    }

    async fn resume_container_traffic(
        &self,
        handle: &str,
    ) -> std::result::Result<(), NetworkError> {
        self.call(format!("resume {handle}"))?;
        if self.without_ip.load(Ordering::SeqCst) {
            return Err(NetworkError::FileStore {
                stage: "looking up container ip",
                source: FileStoreError::IpNotFound { handle: handle.into() },
            });
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeRootfsManager {
    users: Mutex<Vec<PasswdUser>>,
    cwds: Mutex<Vec<(PathBuf, PathBuf)>>,
}

impl FakeRootfsManager {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add_user(&self, user: PasswdUser) {
        lock(&self.users).push(user);
    }

    pub fn cwds(&self) -> Vec<(PathBuf, PathBuf)> {
        lock(&self.cwds).clone()
    }
}

impl RootfsManager for FakeRootfsManager {
    fn setup_cwd(
        &self,
        rootfs: &Path,
        cwd: &Path,
    ) -> std::result::Result<(), RootfsError> {
        lock(&self.cwds).push((rootfs.to_path_buf(), cwd.to_path_buf()));
        Ok(())
    }

    fn lookup_user(
        &self,
        _rootfs: &Path,
        user: &str,
    ) -> std::result::Result<Option<PasswdUser>, RootfsError> {
        Ok(lock(&self.users)
            .iter()
            .find(|u| u.name == user || u.uid.to_string() == user)
            .cloned())
    }
}

pub struct FakeUserNamespace {
    max_uid: u32,
    max_gid: u32,
}

impl FakeUserNamespace {
    pub fn new(max_uid: u32, max_gid: u32) -> Arc<Self> {
        Arc::new(Self { max_uid, max_gid })
    }
}

impl UserNamespace for FakeUserNamespace {
    fn max_valid_ids(
        &self,
    ) -> std::result::Result<(u32, u32), UserNamespaceError> {
        Ok((self.max_uid, self.max_gid))
    }
}

#[derive(Default)]
pub struct FakeCni {
    calls: Mutex<Vec<String>>,
    eth0_ip: Mutex<Option<IpAddr>>,
    fail_remove: AtomicBool,
}

impl FakeCni {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_eth0_ip(&self, ip: &str) {
        *lock(&self.eth0_ip) = Some(ip.parse().expect("ip address"));
    }

    pub fn fail_remove(&self) {
        self.fail_remove.store(true, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<String> {
        lock(&self.calls).clone()
    }
}

#[async_trait]
impl Cni for FakeCni {
    async fn setup(
        &self,
        id: &str,
        netns: &str,
    ) -> std::result::Result<CniResult, CniError> {
        lock(&self.calls).push(format!("setup {id} {netns}"));
        let mut result = CniResult::default();
        if let Some(ip) = *lock(&self.eth0_ip) {
            let _ = result.interfaces.insert(
                "eth0".to_string(),
                InterfaceConfig {
                    sandbox: netns.to_string(),
                    ip_configs: vec![IpConfig { ip, gateway: None }],
                    ..InterfaceConfig::default()
                },
            );
        }
        Ok(result)
    }

    async fn remove(
        &self,
        id: &str,
        netns: &str,
    ) -> std::result::Result<(), CniError> {
        lock(&self.calls).push(format!("remove {id} {netns}"));
        if self.fail_remove.load(Ordering::SeqCst) {
            return Err(CniError::Plugin {
                plugin: "bridge".to_string(),
                code: 11,
                message: "fake teardown failure".to_string(),
            });
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeIptables {
    calls: Mutex<Vec<String>>,
    fail_prefix: Mutex<Option<String>>,
}

impl FakeIptables {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Fails every command starting with `prefix`.
    pub fn fail_on(&self, prefix: &str) {
        *lock(&self.fail_prefix) = Some(prefix.to_string());
    }

    pub fn calls(&self) -> Vec<String> {
        lock(&self.calls).clone()
    }

    fn run(
        &self,
        action: &'static str,
        table: &str,
        chain: &str,
        command: String,
    ) -> std::result::Result<(), IptablesError> {
        lock(&self.calls).push(command.clone());
        match lock(&self.fail_prefix).as_deref() {
            Some(prefix) if command.starts_with(prefix) => {
                Err(IptablesError::Command {
                    action,
                    table: table.to_string(),
                    chain: chain.to_string(),
                    message: "fake iptables failure".to_string(),
                })
            }
            _ => Ok(()),
        }
    }
}

impl Iptables for FakeIptables {
    fn create_chain_or_flush_if_exists(
        &self,
        table: &str,
        chain: &str,
    ) -> std::result::Result<(), IptablesError> {
        let command = format!("create-or-flush {table} {chain}");
        self.run("create chain", table, chain, command)
    }

    fn append_rule(
        &self,
        table: &str,
        chain: &str,
        rulespec: &[&str],
    ) -> std::result::Result<(), IptablesError> {
        let command = format!("append {table} {chain} {}", rulespec.join(" "));
        self.run("append", table, chain, command)
    }

    fn append_unique_rule(
        &self,
        table: &str,
        chain: &str,
        rulespec: &[&str],
    ) -> std::result::Result<(), IptablesError> {
        let command =
            format!("append-unique {table} {chain} {}", rulespec.join(" "));
        self.run("append unique", table, chain, command)
    }

    fn insert_rule(
        &self,
        table: &str,
        chain: &str,
        position: i32,
        rulespec: &[&str],
    ) -> std::result::Result<(), IptablesError> {
        let command = format!(
            "insert {table} {chain} {position} {}",
            rulespec.join(" ")
        );
        self.run("insert", table, chain, command)
    }

    fn delete_rule(
        &self,
        table: &str,
        chain: &str,
        rulespec: &[&str],
    ) -> std::result::Result<(), IptablesError> {
        let command = format!("delete {table} {chain} {}", rulespec.join(" "));
        self.run("delete", table, chain, command)
    }
}
