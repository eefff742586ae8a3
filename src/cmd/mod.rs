pub mod accounts;
pub mod categories;
pub mod goals;
pub mod init;
pub mod link;
pub mod serve;
pub mod sync;
pub mod worker;

use crate::provider::truelayer;
use crate::settings::Settings;

pub(crate) fn provider_client(settings: &Settings) -> truelayer::Client {
    truelayer::Client::new(
        truelayer::Credentials {
            client_id: settings.provider.client_id.clone(),
            client_secret: settings.provider.secret.clone(),
        },
        settings.provider.redirect_uri.clone(),
    )
    .with_base_url(settings.provider.base_url.clone())
}
