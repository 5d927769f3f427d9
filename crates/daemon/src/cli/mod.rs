pub mod args;
pub mod op;
pub mod ops;

crate::command_enum! {
    (Init, ops::Init),
    (Run, ops::Run),
    (Status, ops::Status),
    (Version, ops::Version),
}
