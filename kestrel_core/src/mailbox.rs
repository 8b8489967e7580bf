//! Bounded command mailboxes
//!
//! A [`Mailbox`] moves invocations requested on one thread into the thread that owns the target
//! command. Producers enqueue [`QueuedCommand`]s; the owning task drains them once per cycle with
//! [`Mailbox::execute_next`]. Callers that need the outcome wait on a per-call [`Completion`].
//!
//! Entries own a copy of their argument. An entry that is dropped without being executed (mailbox
//! closed, queue full, owner gone) completes its caller with an error, so a blocked caller is
//! always released.

use crate::command::{Argument, Command};
use crate::error::{CommandError, KestrelError, KestrelResult};
use crossbeam::channel::{bounded, Receiver, Sender, TrySendError};
use parking_lot::{Condvar, Mutex, RwLock};
use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Result of executing a command: an optional return value or a per-call error
pub type CommandOutcome = Result<Option<Argument>, CommandError>;

type PostEnqueue = Box<dyn Fn() + Send + Sync>;

/// Binary wake-up signal (mutex + condition variable)
#[derive(Default)]
pub struct ThreadSignal {
    raised: Mutex<bool>,
    cond: Condvar,
}

impl ThreadSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self) {
        let mut raised = self.raised.lock();
        *raised = true;
        self.cond.notify_all();
    }

    /// Block until raised, then reset
    pub fn wait(&self) {
        let mut raised = self.raised.lock();
        while !*raised {
            self.cond.wait(&mut raised);
        }
        *raised = false;
    }

    /// Block until raised or the timeout elapses. Returns true if the signal was raised.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut raised = self.raised.lock();
        while !*raised {
            if self.cond.wait_until(&mut raised, deadline).timed_out() {
                break;
            }
        }
        std::mem::replace(&mut *raised, false)
    }
}

impl fmt::Debug for ThreadSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadSignal")
            .field("raised", &*self.raised.lock())
            .finish()
    }
}

#[derive(Default)]
struct CompletionSlot {
    done: bool,
    outcome: Option<CommandOutcome>,
}

/// One-shot result slot a blocking caller waits on
#[derive(Default)]
pub struct Completion {
    slot: Mutex<CompletionSlot>,
    cond: Condvar,
}

impl Completion {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Store the outcome and wake the waiter. Only the first call has an effect.
    pub fn complete(&self, outcome: CommandOutcome) {
        let mut slot = self.slot.lock();
        if slot.done {
            return;
        }
        slot.done = true;
        slot.outcome = Some(outcome);
        self.cond.notify_all();
    }

    pub fn is_done(&self) -> bool {
        self.slot.lock().done
    }

    /// Wait for the outcome. `None` waits indefinitely.
    pub fn wait(&self, command: &str, timeout: Option<Duration>) -> CommandOutcome {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut slot = self.slot.lock();
        while !slot.done {
            match deadline {
                Some(deadline) => {
                    if self.cond.wait_until(&mut slot, deadline).timed_out() && !slot.done {
                        return Err(CommandError::Timeout(command.to_string()));
                    }
                }
                None => self.cond.wait(&mut slot),
            }
        }
        slot.outcome
            .take()
            .unwrap_or_else(|| Err(CommandError::MailboxClosed(command.to_string())))
    }
}

/// A pending invocation: the command, an owned copy of its argument, and the caller's completion
pub struct QueuedCommand {
    command: Arc<Command>,
    argument: Option<Argument>,
    completion: Option<Arc<Completion>>,
    mailbox: String,
}

impl QueuedCommand {
    pub fn new(command: Arc<Command>, argument: Option<Argument>) -> Self {
        Self {
            command,
            argument,
            completion: None,
            mailbox: String::new(),
        }
    }

    /// Mark the invocation as blocking; the caller waits on the returned completion
    pub fn blocking(mut self) -> (Self, Arc<Completion>) {
        let completion = Completion::new();
        self.completion = Some(completion.clone());
        (self, completion)
    }

    pub fn command(&self) -> &Command {
        &self.command
    }

    pub fn is_blocking(&self) -> bool {
        self.completion.is_some()
    }

    fn run(&mut self) -> CommandOutcome {
        let argument: Option<&dyn Any> = match &self.argument {
            Some(boxed) => Some(&**boxed),
            None => None,
        };
        self.command.execute(argument)
    }
}

impl Drop for QueuedCommand {
    fn drop(&mut self) {
        if let Some(completion) = self.completion.take() {
            let name = if self.mailbox.is_empty() {
                self.command.name().to_string()
            } else {
                self.mailbox.clone()
            };
            completion.complete(Err(CommandError::MailboxClosed(name)));
        }
    }
}

impl fmt::Debug for QueuedCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueuedCommand")
            .field("command", &self.command.name())
            .field("shape", &self.command.shape())
            .field("blocking", &self.is_blocking())
            .finish()
    }
}

/// Bounded multi-producer, single-consumer command queue
pub struct Mailbox {
    name: String,
    capacity: usize,
    sender: Sender<QueuedCommand>,
    receiver: Receiver<QueuedCommand>,
    closed: RwLock<bool>,
    post_enqueue: Option<PostEnqueue>,
    executed: AtomicU64,
}

impl Mailbox {
    pub fn new(name: &str, capacity: usize) -> KestrelResult<Self> {
        if capacity == 0 {
            return Err(KestrelError::invalid_input(format!(
                "mailbox '{}' capacity must be at least 1",
                name
            )));
        }
        let (sender, receiver) = bounded(capacity);
        Ok(Self {
            name: name.to_string(),
            capacity,
            sender,
            receiver,
            closed: RwLock::new(false),
            post_enqueue: None,
            executed: AtomicU64::new(0),
        })
    }

    /// Register a callable run after every successful enqueue
    pub fn with_post_enqueue<F>(mut self, hook: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.post_enqueue = Some(Box::new(hook));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.receiver.len()
    }

    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.read()
    }

    /// Number of commands executed since construction
    pub fn executed_count(&self) -> u64 {
        self.executed.load(Ordering::Relaxed)
    }

    /// Enqueue a command. Returns false, with no side effect on the queue, if it is full or closed.
    pub fn write(&self, command: QueuedCommand) -> bool {
        self.try_write(command).is_ok()
    }

    /// Enqueue a command, reporting why it was rejected
    pub fn try_write(&self, mut command: QueuedCommand) -> Result<(), CommandError> {
        command.mailbox = self.name.clone();
        {
            let closed = self.closed.read();
            if *closed {
                return Err(CommandError::MailboxClosed(self.name.clone()));
            }
            match self.sender.try_send(command) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    return Err(CommandError::QueueFull(self.name.clone()));
                }
                Err(TrySendError::Disconnected(_)) => {
                    return Err(CommandError::MailboxClosed(self.name.clone()));
                }
            }
        }

        if let Some(hook) = &self.post_enqueue {
            hook();
        }
        Ok(())
    }

    /// Pop and execute one command.
    ///
    /// Returns `Ok(false)` when the queue was empty. An execution error is handed to the blocking
    /// caller (if any) and also returned, after the entry has been removed.
    pub fn execute_next(&self) -> Result<bool, CommandError> {
        let mut entry = match self.receiver.try_recv() {
            Ok(entry) => entry,
            Err(_) => return Ok(false),
        };

        let outcome = entry.run();
        self.executed.fetch_add(1, Ordering::Relaxed);
        let error = outcome.as_ref().err().cloned();
        if let Some(completion) = entry.completion.take() {
            completion.complete(outcome);
        }

        match error {
            Some(err) => Err(err),
            None => Ok(true),
        }
    }

    /// Execute at most one capacity's worth of pending commands, reporting errors through `on_error`.
    /// Returns the number of entries removed.
    pub fn drain<F>(&self, mut on_error: F) -> usize
    where
        F: FnMut(&Mailbox, CommandError),
    {
        let mut processed = 0;
        while processed < self.capacity {
            match self.execute_next() {
                Ok(true) => processed += 1,
                Ok(false) => break,
                Err(err) => {
                    processed += 1;
                    on_error(self, err);
                }
            }
        }
        processed
    }

    /// Reject further writes and fail every pending entry
    pub fn close(&self) -> usize {
        *self.closed.write() = true;
        let mut failed = 0;
        while let Ok(entry) = self.receiver.try_recv() {
            drop(entry);
            failed += 1;
        }
        if failed > 0 {
            log::debug!("Mailbox '{}' closed with {} pending command(s)", self.name, failed);
        }
        failed
    }

    /// Change the capacity. Only legal while nothing is queued and no other handle is writing.
    pub fn set_size(&mut self, capacity: usize) -> KestrelResult<()> {
        if capacity == 0 {
            return Err(KestrelError::invalid_input("mailbox capacity must be at least 1"));
        }
        if !self.is_empty() {
            return Err(KestrelError::invalid_input(format!(
                "mailbox '{}' holds {} pending command(s), cannot resize",
                self.name,
                self.len()
            )));
        }
        let (sender, receiver) = bounded(capacity);
        self.sender = sender;
        self.receiver = receiver;
        self.capacity = capacity;
        Ok(())
    }
}

impl fmt::Debug for Mailbox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mailbox")
            .field("name", &self.name)
            .field("capacity", &self.capacity)
            .field("len", &self.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Drop for Mailbox {
    fn drop(&mut self) {
        self.close();
    }
}

/// All mailboxes drained by one task: one per connected client plus the event mailbox
pub struct MailboxSet {
    owner: String,
    capacity: AtomicUsize,
    commands: RwLock<Vec<Arc<Mailbox>>>,
    /// Set once by `close_all`, under the `commands` write lock
    closed: AtomicBool,
    events: Arc<Mailbox>,
    wake: Arc<ThreadSignal>,
}

impl MailboxSet {
    pub fn new(owner: &str, capacity: usize) -> KestrelResult<Arc<Self>> {
        let wake = Arc::new(ThreadSignal::new());
        let hook = wake.clone();
        let events = Mailbox::new(&format!("{}::events", owner), capacity)?
            .with_post_enqueue(move || hook.raise());
        Ok(Arc::new(Self {
            owner: owner.to_string(),
            capacity: AtomicUsize::new(capacity),
            commands: RwLock::new(Vec::new()),
            closed: AtomicBool::new(false),
            events: Arc::new(events),
            wake,
        }))
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn capacity(&self) -> usize {
        self.capacity.load(Ordering::Relaxed)
    }

    /// Capacity for mailboxes created from now on
    pub fn set_capacity(&self, capacity: usize) {
        self.capacity.store(capacity.max(1), Ordering::Relaxed);
    }

    pub fn wake_signal(&self) -> &Arc<ThreadSignal> {
        &self.wake
    }

    pub fn event_mailbox(&self) -> &Arc<Mailbox> {
        &self.events
    }

    /// True once the owner stopped draining; no mailbox can be added after that
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Create a command mailbox for one client connection.
    ///
    /// Fails with [`CommandError::MailboxClosed`] after `close_all`.
    pub fn create_mailbox(&self, name: &str) -> KestrelResult<Arc<Mailbox>> {
        let full_name = format!("{}::{}", self.owner, name);
        let mut commands = self.commands.write();
        if self.is_closed() {
            return Err(CommandError::MailboxClosed(full_name).into());
        }
        let hook = self.wake.clone();
        let mailbox = Arc::new(
            Mailbox::new(&full_name, self.capacity())?.with_post_enqueue(move || hook.raise()),
        );
        commands.push(mailbox.clone());
        Ok(mailbox)
    }

    pub fn remove_mailbox(&self, mailbox: &Arc<Mailbox>) {
        self.commands.write().retain(|m| !Arc::ptr_eq(m, mailbox));
        mailbox.close();
    }

    pub fn mailbox_count(&self) -> usize {
        self.commands.read().len()
    }

    pub fn pending(&self) -> usize {
        self.events.len() + self.commands.read().iter().map(|m| m.len()).sum::<usize>()
    }

    pub fn process_queued_events<F>(&self, on_error: F) -> usize
    where
        F: FnMut(&Mailbox, CommandError),
    {
        self.events.drain(on_error)
    }

    pub fn process_queued_commands<F>(&self, mut on_error: F) -> usize
    where
        F: FnMut(&Mailbox, CommandError),
    {
        let mailboxes: Vec<Arc<Mailbox>> = self.commands.read().clone();
        mailboxes
            .iter()
            .map(|mailbox| mailbox.drain(&mut on_error))
            .sum()
    }

    /// Close every mailbox, failing pending entries, and refuse new ones
    pub fn close_all(&self) -> usize {
        let commands = self.commands.write();
        self.closed.store(true, Ordering::Release);
        let mut failed = self.events.close();
        for mailbox in commands.iter() {
            failed += mailbox.close();
        }
        failed
    }
}

impl fmt::Debug for MailboxSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MailboxSet")
            .field("owner", &self.owner)
            .field("closed", &self.is_closed())
            .field("mailboxes", &self.mailbox_count())
            .field("pending", &self.pending())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::take_result;
    use std::thread;

    fn recorder() -> (Arc<Mutex<Vec<i32>>>, Arc<Command>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = log.clone();
        let cmd = Arc::new(Command::write("Record", move |v: &i32| sink.lock().push(*v)));
        (log, cmd)
    }

    #[test]
    fn test_capacity_and_fifo() {
        let mailbox = Mailbox::new("test", 3).unwrap();
        let (log, cmd) = recorder();

        for i in 0..3 {
            assert!(mailbox.write(QueuedCommand::new(cmd.clone(), Some(Box::new(i)))));
        }
        assert!(!mailbox.write(QueuedCommand::new(cmd.clone(), Some(Box::new(99)))));
        assert_eq!(mailbox.len(), 3);

        while mailbox.execute_next().unwrap() {}
        assert_eq!(*log.lock(), vec![0, 1, 2]);
        assert!(!mailbox.execute_next().unwrap());
    }

    #[test]
    fn test_post_enqueue_hook_runs_only_on_success() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let mailbox = Mailbox::new("hooked", 1)
            .unwrap()
            .with_post_enqueue(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        let cmd = Arc::new(Command::void("Noop", || {}));

        assert!(mailbox.write(QueuedCommand::new(cmd.clone(), None)));
        assert!(!mailbox.write(QueuedCommand::new(cmd, None)));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_blocking_call_returns_value() {
        let mailbox = Arc::new(Mailbox::new("server", 4).unwrap());
        let cmd = Arc::new(Command::write_return("Double", |v: &i64| v * 2));

        let consumer = mailbox.clone();
        let server = thread::spawn(move || {
            let deadline = Instant::now() + Duration::from_secs(2);
            while Instant::now() < deadline {
                if consumer.execute_next().unwrap() {
                    return;
                }
                thread::sleep(Duration::from_millis(1));
            }
        });

        let (entry, completion) = QueuedCommand::new(cmd, Some(Box::new(21i64))).blocking();
        assert!(mailbox.write(entry));
        let value = completion.wait("Double", Some(Duration::from_secs(2))).unwrap();
        assert_eq!(take_result::<i64>("Double", value).unwrap(), 42);
        server.join().unwrap();
    }

    #[test]
    fn test_failing_entry_is_removed_and_reported() {
        let mailbox = Mailbox::new("faulty", 2).unwrap();
        let cmd = Arc::new(Command::write("Explode", |_v: &u8| panic!("bad write")));

        let (entry, completion) = QueuedCommand::new(cmd, Some(Box::new(1u8))).blocking();
        assert!(mailbox.write(entry));
        assert!(matches!(
            mailbox.execute_next(),
            Err(CommandError::ExecutionFailed { .. })
        ));
        assert!(mailbox.is_empty());
        assert!(matches!(
            completion.wait("Explode", Some(Duration::from_millis(100))),
            Err(CommandError::ExecutionFailed { .. })
        ));
    }

    #[test]
    fn test_close_releases_waiters() {
        let mailbox = Mailbox::new("closing", 2).unwrap();
        let cmd = Arc::new(Command::void("Noop", || {}));
        let (entry, completion) = QueuedCommand::new(cmd.clone(), None).blocking();
        assert!(mailbox.write(entry));

        assert_eq!(mailbox.close(), 1);
        assert_eq!(
            completion.wait("Noop", None).unwrap_err(),
            CommandError::MailboxClosed("closing".to_string())
        );
        assert_eq!(
            mailbox.try_write(QueuedCommand::new(cmd, None)).unwrap_err(),
            CommandError::MailboxClosed("closing".to_string())
        );
    }

    #[test]
    fn test_completion_timeout() {
        let completion = Completion::new();
        let err = completion
            .wait("Slow", Some(Duration::from_millis(10)))
            .unwrap_err();
        assert_eq!(err, CommandError::Timeout("Slow".to_string()));
    }

    #[test]
    fn test_set_size_requires_empty_queue() {
        let mut mailbox = Mailbox::new("resize", 1).unwrap();
        let cmd = Arc::new(Command::void("Noop", || {}));
        assert!(mailbox.write(QueuedCommand::new(cmd.clone(), None)));
        assert!(mailbox.set_size(4).is_err());

        mailbox.execute_next().unwrap();
        mailbox.set_size(4).unwrap();
        for _ in 0..4 {
            assert!(mailbox.write(QueuedCommand::new(cmd.clone(), None)));
        }
        assert_eq!(mailbox.capacity(), 4);
    }

    #[test]
    fn test_mailbox_set_drains_all_and_wakes() {
        let set = MailboxSet::new("owner", 8).unwrap();
        let first = set.create_mailbox("a").unwrap();
        let second = set.create_mailbox("b").unwrap();
        let (log, cmd) = recorder();

        first.write(QueuedCommand::new(cmd.clone(), Some(Box::new(1))));
        second.write(QueuedCommand::new(cmd, Some(Box::new(2))));
        assert!(set.wake_signal().wait_timeout(Duration::from_millis(10)));

        let processed = set.process_queued_commands(|_, err| panic!("unexpected {}", err));
        assert_eq!(processed, 2);
        assert_eq!(*log.lock(), vec![1, 2]);

        set.remove_mailbox(&first);
        assert_eq!(set.mailbox_count(), 1);
        assert!(first.is_closed());
    }

    #[test]
    fn test_closed_set_refuses_new_mailboxes() {
        let set = MailboxSet::new("owner", 4).unwrap();
        let early = set.create_mailbox("early").unwrap();
        assert_eq!(set.close_all(), 0);

        assert!(set.is_closed());
        assert!(early.is_closed());
        assert!(matches!(
            set.create_mailbox("late"),
            Err(KestrelError::Command(CommandError::MailboxClosed(_)))
        ));
        assert_eq!(set.mailbox_count(), 1);
    }
}
