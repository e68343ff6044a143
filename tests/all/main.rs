mod publishers;
