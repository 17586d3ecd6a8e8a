pub mod auctions;
pub mod identity;
pub mod template;

pub use auctions::{AuctionLedger, AuctionObservation, AuctionRecord, PriceSummary};
pub use identity::{IdentityKey, ItemIdentity, ItemIdentityResolver, ItemObservation, PotionAttrs};
