//! Connection dispatch: picking a Herder for a newly-accepted socket (spec
//! section 4.1).

use std::sync::Arc;

use crate::connection::ConnectionRecord;
use crate::error::HerderError;
use crate::herder_list::HerderList;
use crate::socket::Socket;
use crate::Result;

/// Hands `new_socket` off to the least-loaded Herder in `herder_list`.
///
/// The scan reads each Herder's shard-load counter without taking its
/// shard lock, so the choice is best-effort: under concurrent dispatch two
/// callers may briefly pick the same Herder, and a load reading may be
/// stale by the time registration happens. Ties go to whichever Herder was
/// encountered first in list order. This mirrors the accept-hook's
/// least-loaded scan in `tcpha_fe_client_connection.c`, which does not lock
/// the candidate herder while scanning either.
///
/// Returns [`HerderError::NoHerders`] if `herder_list` is empty, and
/// propagates [`HerderError::Duplicate`] or
/// [`HerderError::ResourceExhausted`] from the chosen Herder's own
/// registration if it fails; no partial state is left behind on failure.
pub fn dispatch(herder_list: &HerderList, new_socket: Arc<dyn Socket>) -> Result<()> {
    let herders = herder_list.read();

    let chosen = herders
        .iter()
        .map(|(_, h)| h)
        .min_by_key(|h| h.shard_load())
        .cloned()
        .ok_or(HerderError::NoHerders)?;
    drop(herders);

    let connection = ConnectionRecord::new(new_socket);
    chosen.register_connection(connection)
}
