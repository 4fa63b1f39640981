pub mod check;
pub mod policy;
pub mod run;
