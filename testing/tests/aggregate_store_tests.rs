//! Aggregate store tests against the in-memory event store.

#![allow(clippy::unwrap_used)] // Tests can unwrap
#![allow(clippy::expect_used)] // Tests can expect
#![allow(clippy::panic)] // Tests can panic

use eventline_core::aggregate::{Aggregate, AggregateBase};
use eventline_core::aggregate_store::{AggregateStore, AggregateStoreError};
use eventline_core::event::{CommandMetadata, Event, EventError, SerializedEvent, encode_payload};
use eventline_core::event_store::EventStore;
use eventline_core::serializer::{EventTypeRegistry, Serializer};
use eventline_core::stream::{ExpectedVersion, StreamName, StreamPosition, Version};
use eventline_testing::{InMemoryEventStore, test_clock};
use proptest::prelude::*;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

// ----------------------------------------------------------------------------
// Account aggregate
// ----------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
struct Opened {
    owner: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
struct Deposited {
    amount: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
struct Withdrawn {
    amount: u64,
}

#[derive(Clone, Debug, PartialEq)]
enum AccountEvent {
    Opened(Opened),
    Deposited(Deposited),
    Withdrawn(Withdrawn),
}

impl Event for AccountEvent {
    fn event_type(&self) -> &'static str {
        match self {
            Self::Opened(_) => "AccountOpened.v1",
            Self::Deposited(_) => "MoneyDeposited.v1",
            Self::Withdrawn(_) => "MoneyWithdrawn.v1",
        }
    }

    fn to_payload(&self) -> Result<Vec<u8>, EventError> {
        match self {
            Self::Opened(e) => encode_payload(e),
            Self::Deposited(e) => encode_payload(e),
            Self::Withdrawn(e) => encode_payload(e),
        }
    }
}

#[derive(Debug, thiserror::Error)]
enum AccountError {
    #[error("account is already open")]
    AlreadyOpen,
    #[error("account is not open")]
    NotOpen,
    #[error("insufficient funds: balance {balance}, requested {requested}")]
    InsufficientFunds { balance: u64, requested: u64 },
}

#[derive(Debug)]
struct Account {
    id: String,
    owner: Option<String>,
    balance: u64,
    base: AggregateBase<AccountEvent>,
}

impl Account {
    fn open(&mut self, owner: &str) -> Result<(), AccountError> {
        if self.owner.is_some() {
            return Err(AccountError::AlreadyOpen);
        }
        self.record(AccountEvent::Opened(Opened {
            owner: owner.to_string(),
        }))
    }

    fn deposit(&mut self, amount: u64) -> Result<(), AccountError> {
        self.record(AccountEvent::Deposited(Deposited { amount }))
    }

    fn withdraw(&mut self, amount: u64) -> Result<(), AccountError> {
        self.record(AccountEvent::Withdrawn(Withdrawn { amount }))
    }
}

impl Aggregate for Account {
    const AGGREGATE_TYPE: &'static str = "account";
    type Id = String;
    type Event = AccountEvent;
    type Error = AccountError;

    fn new(id: String) -> Self {
        Self {
            id,
            owner: None,
            balance: 0,
            base: AggregateBase::new(),
        }
    }

    fn id(&self) -> &String {
        &self.id
    }

    fn base(&self) -> &AggregateBase<AccountEvent> {
        &self.base
    }

    fn base_mut(&mut self) -> &mut AggregateBase<AccountEvent> {
        &mut self.base
    }

    fn when(&mut self, event: &AccountEvent) -> Result<(), AccountError> {
        match event {
            AccountEvent::Opened(e) => {
                if self.owner.is_some() {
                    return Err(AccountError::AlreadyOpen);
                }
                self.owner = Some(e.owner.clone());
            }
            AccountEvent::Deposited(e) => {
                if self.owner.is_none() {
                    return Err(AccountError::NotOpen);
                }
                self.balance += e.amount;
            }
            AccountEvent::Withdrawn(e) => {
                if self.owner.is_none() {
                    return Err(AccountError::NotOpen);
                }
                if e.amount > self.balance {
                    return Err(AccountError::InsufficientFunds {
                        balance: self.balance,
                        requested: e.amount,
                    });
                }
                self.balance -= e.amount;
            }
        }
        Ok(())
    }
}

fn account_serializer() -> Serializer<AccountEvent> {
    let registry = EventTypeRegistry::new()
        .with("AccountOpened.v1", AccountEvent::Opened)
        .and_then(|r| r.with("MoneyDeposited.v1", AccountEvent::Deposited))
        .and_then(|r| r.with("MoneyWithdrawn.v1", AccountEvent::Withdrawn))
        .expect("event types are unique");
    Serializer::new(Arc::new(registry))
}

fn setup() -> (Arc<InMemoryEventStore>, AggregateStore<Account>) {
    let event_store = Arc::new(InMemoryEventStore::new().with_clock(Arc::new(test_clock())));
    let accounts = AggregateStore::<Account>::new(event_store.clone(), account_serializer())
        .with_clock(Arc::new(test_clock()));
    (event_store, accounts)
}

async fn opened_account(accounts: &AggregateStore<Account>, id: &str) -> Account {
    let mut account = Account::new(id.to_string());
    account.open("alice").unwrap();
    accounts.store(&mut account, &CommandMetadata::default()).await.unwrap();
    account
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[tokio::test]
async fn store_then_load_rebuilds_state() {
    let (_, accounts) = setup();

    let mut account = Account::new("acc-1".to_string());
    account.open("alice").unwrap();
    account.deposit(100).unwrap();
    account.withdraw(30).unwrap();
    let result = accounts
        .store(&mut account, &CommandMetadata::default())
        .await
        .unwrap()
        .expect("events were pending");

    assert_eq!(result.next_expected_version, Version::new(3));
    assert_eq!(account.version(), Version::new(3));
    assert!(account.pending_events().is_empty());

    let loaded = accounts.load(&"acc-1".to_string()).await.unwrap();
    assert_eq!(loaded.owner.as_deref(), Some("alice"));
    assert_eq!(loaded.balance, 70);
    assert_eq!(loaded.version(), Version::new(3));
    assert!(loaded.pending_events().is_empty());
}

#[tokio::test]
async fn stream_name_is_type_and_id() {
    let (event_store, accounts) = setup();
    opened_account(&accounts, "acc-1").await;

    assert!(event_store.stream_exists(StreamName::new("account-acc-1")).await.unwrap());
    assert!(accounts.exists(&"acc-1".to_string()).await.unwrap());
    assert!(!accounts.exists(&"acc-2".to_string()).await.unwrap());
}

#[tokio::test]
async fn loading_missing_aggregate_is_not_found() {
    let (_, accounts) = setup();

    let result = accounts.load(&"missing".to_string()).await;
    assert!(matches!(result, Err(AggregateStoreError::NotFound(ref s)) if s.as_str() == "account-missing"));

    let fresh = accounts.load_or_new(&"missing".to_string()).await.unwrap();
    assert!(fresh.version().is_initial());
    assert!(fresh.owner.is_none());
}

#[tokio::test]
async fn store_without_pending_events_writes_nothing() {
    let (event_store, accounts) = setup();
    let mut account = opened_account(&accounts, "acc-1").await;

    let result = accounts.store(&mut account, &CommandMetadata::default()).await.unwrap();

    assert!(result.is_none());
    assert_eq!(event_store.event_count(), 1);
}

#[tokio::test]
async fn concurrent_writers_one_wins_one_conflicts() {
    let (event_store, accounts) = setup();
    opened_account(&accounts, "acc-1").await;
    let id = "acc-1".to_string();

    let mut first = accounts.load(&id).await.unwrap();
    let mut second = accounts.load(&id).await.unwrap();
    first.deposit(10).unwrap();
    second.deposit(20).unwrap();

    accounts.store(&mut first, &CommandMetadata::default()).await.unwrap();
    let error = accounts
        .store(&mut second, &CommandMetadata::default())
        .await
        .unwrap_err();

    assert!(error.is_concurrency_conflict());
    match error {
        AggregateStoreError::ConcurrencyConflict { expected, actual, .. } => {
            assert_eq!(expected, ExpectedVersion::Exact(Version::new(1)));
            assert_eq!(actual, Some(Version::new(2)));
        }
        other => panic!("unexpected error: {other}"),
    }
    // The loser keeps its pending events for a retry.
    assert_eq!(second.pending_events().len(), 1);
    assert_eq!(second.version(), Version::new(1));
    assert_eq!(event_store.event_count(), 2);

    // Reload and retry succeeds.
    let mut retried = accounts.load(&id).await.unwrap();
    retried.deposit(20).unwrap();
    accounts.store(&mut retried, &CommandMetadata::default()).await.unwrap();
    assert_eq!(accounts.load(&id).await.unwrap().balance, 30);
}

#[tokio::test]
async fn two_new_aggregates_with_same_id_conflict() {
    let (_, accounts) = setup();

    let mut first = Account::new("acc-1".to_string());
    first.open("alice").unwrap();
    let mut second = Account::new("acc-1".to_string());
    second.open("bob").unwrap();

    accounts.store(&mut first, &CommandMetadata::default()).await.unwrap();
    let error = accounts
        .store(&mut second, &CommandMetadata::default())
        .await
        .unwrap_err();
    assert!(matches!(
        error,
        AggregateStoreError::ConcurrencyConflict {
            expected: ExpectedVersion::NoStream,
            ..
        }
    ));
}

#[tokio::test]
async fn unknown_event_type_fails_load() {
    let (event_store, accounts) = setup();
    opened_account(&accounts, "acc-1").await;
    event_store
        .append_events(
            StreamName::new("account-acc-1"),
            ExpectedVersion::Exact(Version::new(1)),
            vec![SerializedEvent::new("AccountFrozen.v1".to_string(), vec![], None)],
        )
        .await
        .unwrap();

    let error = accounts.load(&"acc-1".to_string()).await.unwrap_err();
    assert!(matches!(
        error,
        AggregateStoreError::Serialization(EventError::UnknownEventType(ref t)) if t == "AccountFrozen.v1"
    ));
}

#[tokio::test]
async fn rejected_replay_reports_position() {
    let (event_store, accounts) = setup();
    opened_account(&accounts, "acc-1").await;
    let overdraft = AccountEvent::Withdrawn(Withdrawn { amount: 5 });
    event_store
        .append_events(
            StreamName::new("account-acc-1"),
            ExpectedVersion::Any,
            vec![SerializedEvent::new(
                overdraft.event_type().to_string(),
                overdraft.to_payload().unwrap(),
                None,
            )],
        )
        .await
        .unwrap();

    let error = accounts.load(&"acc-1".to_string()).await.unwrap_err();
    assert!(matches!(
        error,
        AggregateStoreError::Replay { position, .. } if position == StreamPosition::new(1)
    ));
}

#[tokio::test]
async fn storing_unregistered_event_type_is_rejected_before_writing() {
    let event_store = Arc::new(InMemoryEventStore::new());
    let registry = EventTypeRegistry::new()
        .with("AccountOpened.v1", AccountEvent::Opened)
        .unwrap();
    let accounts = AggregateStore::<Account>::new(event_store.clone(), Serializer::new(Arc::new(registry)));

    let mut account = Account::new("acc-1".to_string());
    account.open("alice").unwrap();
    account.deposit(5).unwrap();

    let error = accounts
        .store(&mut account, &CommandMetadata::default())
        .await
        .unwrap_err();
    assert!(matches!(error, AggregateStoreError::Serialization(EventError::UnknownEventType(_))));
    assert_eq!(event_store.event_count(), 0);
    assert_eq!(account.pending_events().len(), 2);
}

#[tokio::test]
async fn load_at_version_replays_prefix() {
    let (_, accounts) = setup();
    let mut account = Account::new("acc-1".to_string());
    account.open("alice").unwrap();
    account.deposit(10).unwrap();
    account.deposit(20).unwrap();
    accounts.store(&mut account, &CommandMetadata::default()).await.unwrap();
    let id = "acc-1".to_string();

    let at_two = accounts.load_at_version(&id, Version::new(2)).await.unwrap();
    assert_eq!(at_two.balance, 10);
    assert_eq!(at_two.version(), Version::new(2));

    let beyond = accounts.load_at_version(&id, Version::new(5)).await;
    assert!(matches!(
        beyond,
        Err(AggregateStoreError::VersionUnavailable { requested, .. }) if requested == Version::new(5)
    ));

    // A historical snapshot cannot be stored over a newer stream.
    let mut stale = at_two;
    stale.deposit(1).unwrap();
    let error = accounts
        .store(&mut stale, &CommandMetadata::default())
        .await
        .unwrap_err();
    assert!(error.is_concurrency_conflict());
}

#[tokio::test]
async fn command_metadata_and_clock_land_in_envelope() {
    let (event_store, accounts) = setup();
    let mut account = Account::new("acc-1".to_string());
    account.open("alice").unwrap();
    account.deposit(10).unwrap();

    let metadata = CommandMetadata::correlated("corr-1")
        .with_causation_id("cmd-1")
        .with_user_id("alice");
    accounts.store(&mut account, &metadata).await.unwrap();

    let recorded = event_store
        .read_events_from_start(StreamName::new("account-acc-1"))
        .await
        .unwrap();
    for event in &recorded {
        let (_, envelope) = accounts.serializer().deserialize_with_metadata(event).unwrap();
        let envelope = envelope.expect("metadata written");
        assert_eq!(envelope.event_id, event.event_id);
        assert_eq!(envelope.event_type, event.event_type);
        assert_eq!(envelope.correlation_id.as_deref(), Some("corr-1"));
        assert_eq!(envelope.causation_id.as_deref(), Some("cmd-1"));
        assert_eq!(envelope.user_id.as_deref(), Some("alice"));
        assert_eq!(envelope.timestamp, test_clock_time());
    }
    assert_ne!(recorded[0].event_id, recorded[1].event_id);
}

fn test_clock_time() -> chrono::DateTime<chrono::Utc> {
    use eventline_core::environment::Clock;
    test_clock().now()
}

#[tokio::test]
async fn recreated_stream_after_delete_loads_only_new_events() {
    let (event_store, accounts) = setup();
    let id = "acc-1".to_string();
    let mut account = opened_account(&accounts, "acc-1").await;
    account.deposit(50).unwrap();
    accounts.store(&mut account, &CommandMetadata::default()).await.unwrap();

    event_store
        .delete_stream(StreamName::new("account-acc-1"), ExpectedVersion::Any)
        .await
        .unwrap();
    assert!(matches!(accounts.load(&id).await, Err(AggregateStoreError::NotFound(_))));

    let mut reopened = Account::new(id.clone());
    reopened.open("bob").unwrap();
    accounts.store(&mut reopened, &CommandMetadata::default()).await.unwrap();

    let loaded = accounts.load(&id).await.unwrap();
    assert_eq!(loaded.owner.as_deref(), Some("bob"));
    assert_eq!(loaded.balance, 0);
    assert_eq!(loaded.version(), Version::new(3));
}

#[tokio::test]
async fn fully_truncated_stream_is_not_mistaken_for_a_missing_one() {
    let (event_store, accounts) = setup();
    let id = "acc-1".to_string();
    let stream = StreamName::new("account-acc-1");
    opened_account(&accounts, "acc-1").await;

    event_store
        .truncate_stream(stream.clone(), StreamPosition::new(1), ExpectedVersion::Exact(Version::new(1)))
        .await
        .unwrap();

    assert!(accounts.exists(&id).await.unwrap());
    assert!(matches!(accounts.load(&id).await, Err(AggregateStoreError::Truncated(s)) if s == stream));
    assert!(matches!(
        accounts.load_or_new(&id).await,
        Err(AggregateStoreError::Truncated(_))
    ));
    assert_eq!(event_store.stream_version(&stream), Some(Version::new(1)));
}

#[tokio::test]
async fn partially_truncated_stream_replays_the_readable_tail() {
    let (event_store, accounts) = setup();
    let id = "acc-1".to_string();
    let mut account = opened_account(&accounts, "acc-1").await;
    account.deposit(50).unwrap();
    account.deposit(20).unwrap();
    accounts.store(&mut account, &CommandMetadata::default()).await.unwrap();

    event_store
        .truncate_stream(StreamName::new("account-acc-1"), StreamPosition::new(1), ExpectedVersion::Any)
        .await
        .unwrap();

    // The tail starts with a deposit, which a fresh account rejects.
    match accounts.load(&id).await {
        Err(AggregateStoreError::Replay { position, .. }) => assert_eq!(position, StreamPosition::new(1)),
        other => panic!("expected a replay error, got {other:?}"),
    }
    assert!(matches!(
        accounts.load_at_version(&id, Version::new(1)).await,
        Err(AggregateStoreError::VersionUnavailable { .. })
    ));
}

fn account_event() -> impl Strategy<Value = AccountEvent> {
    prop_oneof![
        (1u64..1_000).prop_map(|amount| AccountEvent::Deposited(Deposited { amount })),
        (1u64..1_000).prop_map(|amount| AccountEvent::Withdrawn(Withdrawn { amount })),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn load_after_store_matches_in_memory_state(events in prop::collection::vec(account_event(), 0..20)) {
        let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
        runtime.block_on(async {
            let (_, accounts) = setup();
            let mut account = Account::new("acc-p".to_string());
            account.open("carol").unwrap();
            for event in events {
                // Overdrafts are rejected by the aggregate; the rest is recorded.
                let _ = account.record(event);
            }
            let expected_events = account.pending_events().to_vec();
            let expected_balance = account.balance;

            accounts.store(&mut account, &CommandMetadata::default()).await.unwrap();
            let loaded = accounts.load(&"acc-p".to_string()).await.unwrap();

            prop_assert_eq!(loaded.balance, expected_balance);
            prop_assert_eq!(loaded.version(), Version::new(expected_events.len() as u64));

            let stored = accounts
                .serializer()
                .registry()
                .decode(expected_events[0].event_type(), &expected_events[0].to_payload().unwrap())
                .unwrap();
            prop_assert_eq!(&stored, &expected_events[0]);
            Ok(())
        })?;
    }
}
