pub mod candidates;
pub mod catalog;
pub mod cold_start;
pub mod feedback;
pub mod history;
pub mod learning;
pub mod profiles;
pub mod rate_limit;
pub mod recommendations;
pub mod scoring;
