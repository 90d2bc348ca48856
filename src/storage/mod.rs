pub mod journal;
pub mod recovery;
pub mod store;

pub use journal::{JournalEvent, JournalEventKind, SignalJournal};
pub use store::{SqliteStore, StoredOrder, StoredPosition, TRADING_DISABLED_FLAG};
