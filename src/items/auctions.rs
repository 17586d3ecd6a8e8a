use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::StatsResult;
use crate::items::identity::{ItemIdentityResolver, ItemObservation};
use crate::storage::Store;

#[derive(Debug, Clone)]
pub struct AuctionObservation {
    pub auction_id: String,
    pub item: ItemObservation,
    // Total price paid for the whole stack
    pub price: f64,
    pub count: u32,
    pub bin: bool,
    pub ended_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuctionRecord {
    pub auction_id: String,
    pub identity_id: String,
    pub unit_price: f64,
    pub count: u32,
    pub bin: bool,
    pub ended_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PriceSummary {
    pub count: usize,
    pub lowest: f64,
    pub median: f64,
    pub average: f64,
}

impl PriceSummary {
    fn from_prices(mut prices: Vec<f64>) -> Option<Self> {
        if prices.is_empty() {
            return None;
        }
        prices.sort_by(f64::total_cmp);
        let count = prices.len();
        let median = match count % 2 {
            0 => (prices[count / 2 - 1] + prices[count / 2]) / 2.0,
            _ => prices[count / 2],
        };
        Some(PriceSummary {
            count,
            lowest: prices[0],
            median,
            average: prices.iter().sum::<f64>() / count as f64,
        })
    }
}

/// Sold auctions per item identity, for price lookups.
pub struct AuctionLedger {
    resolver: Arc<ItemIdentityResolver>,
    store: Arc<dyn Store>,
}

impl AuctionLedger {
    pub fn new(resolver: Arc<ItemIdentityResolver>, store: Arc<dyn Store>) -> Self {
        AuctionLedger { resolver, store }
    }

    /// Persist a sold auction under the identity of its item. Returns that identity.
    pub async fn record(&self, auction: &AuctionObservation) -> StatsResult<Option<String>> {
        let identity_id = match self.resolver.resolve(&auction.item, true).await? {
            Some(identity_id) => identity_id,
            None => return Ok(None),
        };
        let record = AuctionRecord {
            auction_id: auction.auction_id.clone(),
            identity_id: identity_id.clone(),
            unit_price: auction.price / auction.count.max(1) as f64,
            count: auction.count,
            bin: auction.bin,
            ended_at: auction.ended_at,
        };
        self.store.insert_auction(record).await?;
        Ok(Some(identity_id))
    }

    /// Unit prices of "buy it now" sales since `since`. `None` without any sale.
    pub async fn price_summary(
        &self,
        identity_id: &str,
        since: DateTime<Utc>,
    ) -> StatsResult<Option<PriceSummary>> {
        let prices = self
            .store
            .find_auctions(identity_id, since)
            .await?
            .into_iter()
            .filter(|auction| auction.bin)
            .map(|auction| auction.unit_price)
            .collect();
        Ok(PriceSummary::from_prices(prices))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use chrono::Duration;

    fn sale(auction_id: &str, price: f64, count: u32, bin: bool, age_days: i64) -> AuctionObservation {
        AuctionObservation {
            auction_id: auction_id.to_string(),
            item: ItemObservation {
                id: "ENCHANTED_DIAMOND".to_string(),
                name: "Enchanted Diamond".to_string(),
                ..Default::default()
            },
            price,
            count,
            bin,
            ended_at: Utc::now() - Duration::days(age_days),
        }
    }

    fn ledger() -> AuctionLedger {
        let store = Arc::new(MemoryStore::new());
        AuctionLedger::new(Arc::new(ItemIdentityResolver::new(store.clone())), store)
    }

    #[tokio::test]
    async fn summary_covers_recent_bin_sales_per_unit() {
        let ledger = ledger();
        let identity = ledger.record(&sale("a", 1000.0, 1, true, 0)).await.unwrap().unwrap();
        ledger.record(&sale("b", 6000.0, 2, true, 1)).await.unwrap();
        ledger.record(&sale("c", 2000.0, 1, true, 1)).await.unwrap();
        ledger.record(&sale("d", 4000.0, 1, true, 2)).await.unwrap();
        // Not a fixed price
        ledger.record(&sale("e", 1.0, 1, false, 0)).await.unwrap();
        // Too old
        ledger.record(&sale("f", 1.0, 1, true, 30)).await.unwrap();
        // Recorded twice
        ledger.record(&sale("d", 4000.0, 1, true, 2)).await.unwrap();

        let summary = ledger
            .price_summary(&identity, Utc::now() - Duration::days(7))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            summary,
            PriceSummary {
                count: 4,
                lowest: 1000.0,
                median: 2500.0,
                average: 2500.0,
            }
        );
    }

    #[tokio::test]
    async fn no_sale_has_no_summary() {
        let ledger = ledger();
        assert_eq!(
            ledger.price_summary("unknown", Utc::now()).await.unwrap(),
            None
        );
    }
}
