pub mod container;
pub mod quicken;
pub mod unquicken;
