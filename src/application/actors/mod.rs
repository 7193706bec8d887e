pub mod journal_actor;
pub mod pair_worker;
