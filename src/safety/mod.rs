pub mod brake;
