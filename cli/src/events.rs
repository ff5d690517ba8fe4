// Sample account events used by the seed and tail commands.

use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize)]
pub struct AccountCreated {
    pub account_number: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AccountCredited {
    pub amount: i64,
    pub description: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AccountDebited {
    pub amount: i64,
    pub description: String,
}
