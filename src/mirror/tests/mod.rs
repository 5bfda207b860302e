mod lifecycle;
mod recycle;
