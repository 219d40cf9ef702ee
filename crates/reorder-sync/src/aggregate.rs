//! Last purchase per client, from a full sale set or from the store.

use std::collections::{BTreeMap, BTreeSet};

use anyhow::{Context, Result};
use reorder_core::{LastPurchase, Sale};
use reorder_storage::SaleStore;

/// One pass over `sales`, keeping the highest-ranked sale per client.
///
/// A sale only replaces the current pick when it ranks strictly higher, so
/// the result does not depend on input order.
pub fn last_purchases_from_sales<'a>(
    sales: impl IntoIterator<Item = &'a Sale>,
) -> BTreeMap<String, LastPurchase> {
    let mut last: BTreeMap<String, LastPurchase> = BTreeMap::new();
    for sale in sales {
        match last.get(&sale.client_id) {
            Some(current) if current.rank() >= sale.rank() => {}
            _ => {
                last.insert(sale.client_id.clone(), LastPurchase::from_sale(sale));
            }
        }
    }
    last
}

pub fn touched_clients(batch: &[Sale]) -> BTreeSet<String> {
    batch.iter().map(|sale| sale.client_id.clone()).collect()
}

/// Re-derives `clients` from everything stored, so a backfilled older sale
/// never masks a newer one already on file.
pub async fn last_purchases_for_clients(
    store: &dyn SaleStore,
    clients: &BTreeSet<String>,
) -> Result<BTreeMap<String, LastPurchase>> {
    if clients.is_empty() {
        return Ok(BTreeMap::new());
    }
    store
        .last_purchase_per_client(Some(clients))
        .await
        .with_context(|| format!("querying last purchase for {} clients", clients.len()))
}
