mod calibration;
mod drift;
mod fault;
mod lifecycle;
mod support;
mod telemetry;
