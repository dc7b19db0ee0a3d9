//! Accounts, audiences and draft campaigns loaded from the configuration file
//!
//! ```ron
//! seed: (
//!     accounts: [(id: "01J8Z00000000000000000000A", name: "Acme", plan: pro, max_24_hour_send: 50000)],
//!     audiences: [(
//!         audience: (list_id: "01J8Z00000000000000000000B"),
//!         recipients: [(email: "first@example.test"), (email: "second@example.test")],
//!     )],
//!     campaigns: [(
//!         account_id: "01J8Z00000000000000000000A",
//!         list_id: "01J8Z00000000000000000000B",
//!         name: "Launch",
//!         subject: "Hello",
//!         from_name: "Acme",
//!         from_email: "news@acme.test",
//!     )],
//! )
//! ```

use std::sync::Arc;

use ember_common::internal;
use ember_delivery::StaticRecipientSource;
use ember_store::{Account, Audience, Campaign, CampaignStore, Recipient};
use serde::Deserialize;

/// Recipients for one list or segment
#[derive(Debug, Clone, Deserialize)]
pub struct AudienceSeed {
    pub audience: Audience,
    #[serde(default)]
    pub recipients: Vec<Recipient>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Seed {
    #[serde(default)]
    pub accounts: Vec<Account>,
    #[serde(default)]
    pub audiences: Vec<AudienceSeed>,
    #[serde(default)]
    pub campaigns: Vec<Campaign>,
}

impl Seed {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty() && self.audiences.is_empty() && self.campaigns.is_empty()
    }

    /// Load everything into the store and recipient source
    ///
    /// Accounts go in first so a campaign naming an unknown account is
    /// refused.
    ///
    /// # Errors
    ///
    /// If the store refuses a record or a campaign's account is missing
    pub async fn apply(
        self,
        store: &Arc<dyn CampaignStore>,
        recipients: &StaticRecipientSource,
    ) -> ember_store::Result<()> {
        for account in self.accounts {
            internal!(level = DEBUG, "Seeding account {} ({})", account.name, account.id);
            store.put_account(account).await?;
        }

        for AudienceSeed {
            audience,
            recipients: members,
        } in self.audiences
        {
            internal!(
                level = DEBUG,
                "Seeding {} recipients for list {}",
                members.len(),
                audience.list_id
            );
            recipients.insert(audience, members);
        }

        for campaign in self.campaigns {
            store.account(&campaign.account_id).await?;
            internal!(
                level = INFO,
                "Seeding campaign {} ({}) in status {}",
                campaign.name,
                campaign.id,
                campaign.status
            );
            store.insert_campaign(campaign).await?;
        }

        Ok(())
    }
}
