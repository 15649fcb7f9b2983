pub mod build;
pub mod installation;
pub mod membership;
pub mod project;
pub mod session;
