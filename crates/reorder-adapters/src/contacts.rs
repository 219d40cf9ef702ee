//! Client directory, loaded in full once per run.

use std::collections::HashMap;

use reorder_core::Client;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use tracing::{info, warn};

use crate::paginate::{PaginationConfig, Paginator};
use crate::{ref_id, Endpoint, PageSource, RawId, RawRef};

#[derive(Debug, Deserialize)]
struct RawContact {
    #[serde(default)]
    id: Option<RawId>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    email: Option<String>,
    #[serde(default, rename = "priceList")]
    price_list: Option<RawRef>,
    #[serde(default)]
    address: Option<RawAddress>,
    #[serde(default)]
    city: Option<String>,
    #[serde(default)]
    state: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawAddress {
    #[serde(default)]
    city: Option<String>,
    #[serde(default)]
    state: Option<String>,
}

fn clean(value: Option<&str>) -> String {
    value.map(str::trim).unwrap_or_default().to_string()
}

/// Structured address first, flat top-level fields as fallback.
fn location(contact: &RawContact) -> (String, String) {
    let address = contact.address.as_ref();
    let mut city = clean(address.and_then(|a| a.city.as_deref()));
    let mut state = clean(address.and_then(|a| a.state.as_deref()));
    if city.is_empty() {
        city = clean(contact.city.as_deref());
    }
    if state.is_empty() {
        state = clean(contact.state.as_deref());
    }
    (city, state)
}

pub fn client_from_raw(raw: &JsonValue) -> Option<Client> {
    let contact: RawContact = serde_json::from_value(raw.clone()).ok()?;
    let client_id = contact.id.as_ref().map(|id| id.0.clone()).filter(|id| !id.is_empty())?;
    let (city, state) = location(&contact);
    Some(Client {
        client_id,
        display_name: clean(contact.name.as_deref()),
        email: clean(contact.email.as_deref()),
        default_price_list_id: ref_id(contact.price_list.as_ref()),
        city,
        state,
    })
}

/// Client lookup by id for one run.
#[derive(Debug, Clone, Default)]
pub struct ContactDirectory {
    clients: HashMap<String, Client>,
    pub truncated: bool,
    pub rejected: usize,
}

impl ContactDirectory {
    pub fn from_clients(clients: impl IntoIterator<Item = Client>) -> Self {
        Self {
            clients: clients
                .into_iter()
                .map(|c| (c.client_id.clone(), c))
                .collect(),
            ..Default::default()
        }
    }

    pub fn get(&self, client_id: &str) -> Option<&Client> {
        self.clients.get(client_id)
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}

/// Drain the contact collection, never filtered by date.
pub async fn load_contact_directory(
    source: &dyn PageSource,
    pagination: PaginationConfig,
) -> ContactDirectory {
    let drained = Paginator::new(source, Endpoint::Contacts, None, pagination)
        .drain()
        .await;

    let mut directory = ContactDirectory {
        truncated: drained.truncated,
        ..Default::default()
    };
    for raw in &drained.items {
        match client_from_raw(raw) {
            Some(client) => {
                directory.clients.insert(client.client_id.clone(), client);
            }
            None => directory.rejected += 1,
        }
    }

    if directory.rejected > 0 {
        warn!(rejected = directory.rejected, "contacts without a usable id were skipped");
    }
    info!(
        contacts = directory.len(),
        truncated = directory.truncated,
        "contact directory loaded"
    );
    directory
}
