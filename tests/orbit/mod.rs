mod coast;
mod modeq;
