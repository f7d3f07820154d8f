pub mod backup_flow;
