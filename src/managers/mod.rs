pub mod ssh;
pub mod zabbix;
