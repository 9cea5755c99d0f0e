mod contact;
mod deadline;
mod election_timer;
mod leader_timer;
mod time;

#[cfg(test)]
mod test_utils;

pub(crate) use contact::LastContact;
pub(super) use election_timer::ElectionTimerHandle;
pub(super) use leader_timer::LeaderTimerHandle;
