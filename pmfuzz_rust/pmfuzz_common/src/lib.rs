pub mod failure_list;
pub mod naming;
