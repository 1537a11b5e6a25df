pub mod inspect;
pub mod loopback;
