pub mod init;
pub mod layers;
pub mod run;
pub mod status;
