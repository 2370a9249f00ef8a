pub mod helpers;
mod tests_replay;
