pub mod accumulator;
pub mod discovery;
pub mod external;
pub mod guard;
pub mod keys;
pub mod merge;
pub mod metadata;
pub mod noise;
pub mod resample;
pub mod scaling;
pub mod storage;
