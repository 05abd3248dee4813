pub mod category;
pub mod money;
pub mod normalize;
pub mod transaction;

pub use category::{CategorySet, Reconciled, DEFAULT_CATEGORIES, FALLBACK_CATEGORY};
pub use money::Money;
pub use normalize::{clean_vendor, normalize_description, Fingerprint, VENDOR_MAX_LEN};
pub use transaction::{
    Label, LabeledTransaction, MatchSource, RawTransaction, Transaction, TransactionKey,
    ValidationError,
};
