// Services module - remote server access and run bookkeeping

pub mod abs;
pub mod audit;
