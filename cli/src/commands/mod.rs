pub mod cli;
pub mod fetch;
pub mod run;
pub mod worker;
