//! Process-wide registry of live connection names.
//!
//! Every [`ConnectionNode`](crate::ConnectionNode) registers its unique name
//! here while it owns a connection object, so two nodes can never end up
//! sharing one name, and a name can be inspected from anywhere in the process.

use std::collections::HashMap;
use std::sync::Mutex;

use lazy_static::lazy_static;

lazy_static! {
    static ref CONNECTIONS: Mutex<HashMap<String, String>> = Mutex::new(HashMap::new());
}

fn with_names<R>(func: impl FnOnce(&mut HashMap<String, String>) -> R) -> R {
    let mut guard = match CONNECTIONS.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    func(&mut guard)
}

/// Register `connection_name` for `driver_name`.
///
/// Returns `false` (and replaces the old entry) when the name was already
/// taken by another registration.
pub fn register(connection_name: &str, driver_name: &str) -> bool {
    let previous = with_names(|names| {
        names.insert(connection_name.to_string(), driver_name.to_string())
    });
    match previous {
        None => true,
        Some(ref old) if old == driver_name => true,
        Some(old) => {
            tracing::warn!(
                connection = connection_name,
                old_driver = %old,
                new_driver = driver_name,
                "duplicate connection name, previous registration replaced"
            );
            false
        }
    }
}

/// Remove `connection_name`. Returns whether it was registered.
pub fn deregister(connection_name: &str) -> bool {
    with_names(|names| names.remove(connection_name).is_some())
}

#[must_use]
pub fn is_registered(connection_name: &str) -> bool {
    with_names(|names| names.contains_key(connection_name))
}

/// Driver a name is registered under.
#[must_use]
pub fn driver_of(connection_name: &str) -> Option<String> {
    with_names(|names| names.get(connection_name).cloned())
}

/// Names currently registered whose prefix is `connection_id`.
#[must_use]
pub fn names_for(connection_id: &str) -> Vec<String> {
    let prefix = format!("{connection_id}(");
    let mut found: Vec<String> = with_names(|names| {
        names
            .keys()
            .filter(|name| name.starts_with(&prefix))
            .cloned()
            .collect()
    });
    found.sort();
    found
}
